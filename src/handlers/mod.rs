//! Per-event-type processing callbacks.
//!
//! This module contains:
//! - `EventHandler` trait: the seam between the consumer engine and
//!   business side effects
//! - `HandlerError`: failure taxonomy driving retry vs dead-letter
//! - Concrete handlers for auction and bid events

use async_trait::async_trait;

use crate::envelope::DeliveryMeta;
use crate::events::DomainEvent;

mod auction;
mod bid;

pub use auction::{AuctionCreatedHandler, AuctionFinishedHandler};
pub use bid::BidPlacedHandler;

/// Failure taxonomy for event handling.
///
/// Permanent failures go straight to the dead-letter queue; recoverable
/// ones are retried up to the engine's bounded budget.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The body cannot be decoded; retrying will never succeed.
    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// No handler is registered for this discriminator.
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    /// Recoverable failure; the engine applies its retry policy.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Permanent failures bypass the retry budget entirely.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            HandlerError::Malformed { .. } | HandlerError::UnknownEventType(_)
        )
    }
}

/// Processing callback for one event type.
///
/// Handlers own three responsibilities: check the processed-event ledger,
/// apply the side effect, and record the event id. Expected business
/// conditions come back as `HandlerError::Failed`, never as panics; the
/// engine translates the outcome into ack, retry, or dead-letter.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, body: &[u8], meta: &DeliveryMeta) -> Result<(), HandlerError>;
}

/// Decode a serialized event body, classifying failure as permanent.
pub fn decode_event<E: DomainEvent>(body: &[u8]) -> Result<E, HandlerError> {
    serde_json::from_slice(body).map_err(|source| HandlerError::Malformed {
        event_type: E::EVENT_TYPE,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AuctionCreatedEvent;

    #[test]
    fn malformed_and_unknown_are_permanent() {
        let malformed = decode_event::<AuctionCreatedEvent>(b"not json").unwrap_err();
        assert!(malformed.is_permanent());

        assert!(HandlerError::UnknownEventType("Whatever".to_string()).is_permanent());
    }

    #[test]
    fn business_failure_is_recoverable() {
        assert!(!HandlerError::Failed("downstream unavailable".to_string()).is_permanent());
    }

    #[test]
    fn decode_event_names_the_event_type() {
        let err = decode_event::<AuctionCreatedEvent>(b"{}").unwrap_err();
        assert!(err.to_string().contains("AuctionCreatedEvent"));
    }
}
