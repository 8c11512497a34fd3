//! Handler for bid placement events.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{decode_event, EventHandler, HandlerError};
use crate::envelope::DeliveryMeta;
use crate::events::BidPlacedEvent;
use crate::idempotency::ProcessedEventStore;

/// Applies downstream effects of `BidPlacedEvent`: cache invalidation for
/// the auction, outbid notification, leaderboard update.
pub struct BidPlacedHandler {
    store: Arc<dyn ProcessedEventStore>,
}

impl BidPlacedHandler {
    pub fn new(store: Arc<dyn ProcessedEventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for BidPlacedHandler {
    async fn handle(&self, body: &[u8], meta: &DeliveryMeta) -> Result<(), HandlerError> {
        let event: BidPlacedEvent = decode_event(body)?;

        if self
            .store
            .is_processed(event.event_id)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?
        {
            info!(event_id = %event.event_id, "Event already processed, skipping");
            return Ok(());
        }

        info!(
            auction_id = %event.auction_id,
            bidder_id = %event.bidder_id,
            bid_amount = event.bid_amount,
            total_bids = event.total_bids,
            correlation_id = ?meta.correlation_id,
            "Processing bid placed"
        );

        self.store
            .mark_processed(event.event_id)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::InMemoryProcessedStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_bid() -> BidPlacedEvent {
        BidPlacedEvent {
            event_id: Uuid::new_v4(),
            correlation_id: "corr-b1".to_string(),
            timestamp: Utc::now(),
            auction_id: "A1".to_string(),
            bidder_id: "B7".to_string(),
            bid_amount: 210.0,
            previous_price: 200.0,
            total_bids: 4,
        }
    }

    #[tokio::test]
    async fn applies_bid_exactly_once() {
        let store = Arc::new(InMemoryProcessedStore::new());
        let handler = BidPlacedHandler::new(store.clone());
        let event = sample_bid();
        let body = serde_json::to_vec(&event).unwrap();

        handler
            .handle(&body, &DeliveryMeta::default())
            .await
            .unwrap();
        handler
            .handle(&body, &DeliveryMeta::default())
            .await
            .unwrap();

        assert!(store.is_processed(event.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_shape_is_permanent() {
        let handler = BidPlacedHandler::new(Arc::new(InMemoryProcessedStore::new()));

        let err = handler
            .handle(b"[1,2,3]", &DeliveryMeta::default())
            .await
            .unwrap_err();

        assert!(err.is_permanent());
    }
}
