//! Handlers for auction lifecycle events.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{decode_event, EventHandler, HandlerError};
use crate::envelope::DeliveryMeta;
use crate::events::{AuctionCreatedEvent, AuctionFinishedEvent};
use crate::idempotency::ProcessedEventStore;

/// Applies downstream effects of `AuctionCreatedEvent`: projection updates,
/// seller notifications.
pub struct AuctionCreatedHandler {
    store: Arc<dyn ProcessedEventStore>,
}

impl AuctionCreatedHandler {
    pub fn new(store: Arc<dyn ProcessedEventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for AuctionCreatedHandler {
    async fn handle(&self, body: &[u8], meta: &DeliveryMeta) -> Result<(), HandlerError> {
        let event: AuctionCreatedEvent = decode_event(body)?;

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
            artwork_name = %event.artwork_name,
            seller_id = %event.seller_id,
            correlation_id = ?meta.correlation_id,
            "Processing auction created"
        );

        self.store
            .mark_processed(event.event_id)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        Ok(())
    }
}

/// Applies downstream effects of `AuctionFinishedEvent`: winner
/// notification, final projection update.
pub struct AuctionFinishedHandler {
    store: Arc<dyn ProcessedEventStore>,
}

impl AuctionFinishedHandler {
    pub fn new(store: Arc<dyn ProcessedEventStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for AuctionFinishedHandler {
    async fn handle(&self, body: &[u8], meta: &DeliveryMeta) -> Result<(), HandlerError> {
        let event: AuctionFinishedEvent = decode_event(body)?;

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
            winner_id = ?event.winner_id,
            final_price = ?event.final_price,
            total_bids = event.total_bids,
            correlation_id = ?meta.correlation_id,
            "Processing auction finished"
        );

        self.store
            .mark_processed(event.event_id)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        Ok(())
    }
}
