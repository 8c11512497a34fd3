//! Domain events carried over the message bus.
//!
//! One variant per business occurrence. Payload fields are plain value
//! types; no entity graphs cross the wire. Field names serialize in
//! camelCase to stay schema-compatible with the other services on the bus.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Capability every publishable event must provide.
///
/// `event_id` is generated once by the producer and never changes; consumers
/// key idempotency checks on it. `correlation_id` threads a request across
/// services and is resolved statically here rather than via runtime
/// introspection.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    /// Logical type name, used as the `event-type` header discriminator.
    const EVENT_TYPE: &'static str;

    /// Producer-generated unique identifier for idempotent consumption.
    fn event_id(&self) -> Uuid;

    /// Caller-supplied correlation identifier; may be empty.
    fn correlation_id(&self) -> &str;
}

/// Raised after an auction has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionCreatedEvent {
    pub event_id: Uuid,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,

    pub auction_id: String,
    pub artwork_name: String,
    pub seller_id: String,
    pub start_price_amount: f64,
    pub start_price_currency: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl DomainEvent for AuctionCreatedEvent {
    const EVENT_TYPE: &'static str = "AuctionCreatedEvent";

    fn event_id(&self) -> Uuid {
        self.event_id
    }

    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Raised after a bid has been accepted on a running auction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidPlacedEvent {
    pub event_id: Uuid,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,

    pub auction_id: String,
    pub bidder_id: String,
    pub bid_amount: f64,
    pub previous_price: f64,
    pub total_bids: u32,
}

impl DomainEvent for BidPlacedEvent {
    const EVENT_TYPE: &'static str = "BidPlacedEvent";

    fn event_id(&self) -> Uuid {
        self.event_id
    }

    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Raised when an auction closes, with or without a winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionFinishedEvent {
    pub event_id: Uuid,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,

    pub auction_id: String,
    pub winner_id: Option<String>,
    pub final_price: Option<f64>,
    pub total_bids: u32,
    pub has_winner: bool,
}

impl DomainEvent for AuctionFinishedEvent {
    const EVENT_TYPE: &'static str = "AuctionFinishedEvent";

    fn event_id(&self) -> Uuid {
        self.event_id
    }

    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_created() -> AuctionCreatedEvent {
        AuctionCreatedEvent {
            event_id: Uuid::new_v4(),
            correlation_id: "corr-123".to_string(),
            timestamp: Utc::now(),
            auction_id: "A1".to_string(),
            artwork_name: "Starry Night".to_string(),
            seller_id: "S1".to_string(),
            start_price_amount: 150.0,
            start_price_currency: "EUR".to_string(),
            start_time: Utc::now(),
            end_time: Utc::now(),
        }
    }

    #[test]
    fn serializes_camel_case() {
        let event = sample_created();
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"eventId\""));
        assert!(json.contains("\"correlationId\""));
        assert!(json.contains("\"auctionId\""));
        assert!(json.contains("\"artworkName\""));
        assert!(json.contains("\"startPriceAmount\""));
    }

    #[test]
    fn round_trips_through_json() {
        let event = sample_created();
        let json = serde_json::to_vec(&event).unwrap();
        let decoded: AuctionCreatedEvent = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn event_type_discriminators_are_distinct() {
        assert_eq!(AuctionCreatedEvent::EVENT_TYPE, "AuctionCreatedEvent");
        assert_eq!(BidPlacedEvent::EVENT_TYPE, "BidPlacedEvent");
        assert_eq!(AuctionFinishedEvent::EVENT_TYPE, "AuctionFinishedEvent");
    }

    #[test]
    fn finished_event_allows_no_winner() {
        let event = AuctionFinishedEvent {
            event_id: Uuid::new_v4(),
            correlation_id: String::new(),
            timestamp: Utc::now(),
            auction_id: "A2".to_string(),
            winner_id: None,
            final_price: None,
            total_bids: 0,
            has_winner: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        let decoded: AuctionFinishedEvent = serde_json::from_str(&json).unwrap();
        assert!(decoded.winner_id.is_none());
        assert!(!decoded.has_winner);
    }
}
