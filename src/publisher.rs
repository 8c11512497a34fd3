//! Event publisher: serializes domain events onto the live topic exchange.
//!
//! Publication is best-effort relative to the originating write: a command
//! handler calls [`EventPublisher::publish`] after its persistence step
//! succeeds, logs any failure, and never rolls the write back because of
//! one. There is no publisher-confirm wait; the at-least-once guarantee
//! lives on the consumption side.

use std::sync::Arc;

use lapin::options::BasicPublishOptions;
use tracing::{error, info};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError};
use crate::envelope;
use crate::events::DomainEvent;
use crate::topology::EVENTS_EXCHANGE;

/// Errors surfaced to the publishing caller.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to serialize {event_type}: {source}")]
    Serialize {
        event_type: &'static str,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to publish {event_type} with routing key '{routing_key}': {source}")]
    Transport {
        event_type: &'static str,
        routing_key: String,
        source: lapin::Error,
    },
}

/// Publishes domain events to the `auction-events` topic exchange.
pub struct EventPublisher {
    broker: Arc<Broker>,
}

impl EventPublisher {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Serialize `event` and publish it with the given routing key.
    ///
    /// The routing key must match one of the topology's bound keys; a
    /// mismatch produces an unroutable message the broker drops. The
    /// correlation id is taken from the event itself, or generated fresh
    /// when the event carries none.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(event_type = E::EVENT_TYPE, routing_key = %routing_key)
    )]
    pub async fn publish<E: DomainEvent>(
        &self,
        event: &E,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_vec(event).map_err(|source| PublishError::Serialize {
            event_type: E::EVENT_TYPE,
            source,
        })?;

        let correlation_id = effective_correlation_id(event.correlation_id());
        let properties = envelope::publish_properties(E::EVENT_TYPE, &correlation_id);

        let channel = self.broker.channel().await?;
        let _ = channel
            .basic_publish(
                EVENTS_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|source| {
                error!(
                    event_type = E::EVENT_TYPE,
                    routing_key = %routing_key,
                    error = %source,
                    "Failed to publish event"
                );
                PublishError::Transport {
                    event_type: E::EVENT_TYPE,
                    routing_key: routing_key.to_string(),
                    source,
                }
            })?;

        info!(
            event_type = E::EVENT_TYPE,
            routing_key = %routing_key,
            correlation_id = %correlation_id,
            event_id = %event.event_id(),
            "Published event"
        );

        Ok(())
    }
}

/// Use the event's own correlation id when present, else mint one.
fn effective_correlation_id(from_event: &str) -> String {
    if from_event.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        from_event.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_prefers_the_event_field() {
        assert_eq!(effective_correlation_id("corr-7"), "corr-7");
    }

    #[test]
    fn correlation_id_is_generated_when_missing() {
        let generated = effective_correlation_id("");
        assert!(!generated.is_empty());
        assert!(Uuid::parse_str(&generated).is_ok());
    }
}
