//! Exchange/queue/binding graph for auction events.
//!
//! Declared once at process start. Declarations are idempotent: redeclaring
//! with identical arguments is a no-op, while conflicting arguments surface
//! as a broker error rather than silently mutating the topology. Any
//! failure here is fatal at startup; the process must not consume without
//! confirmed durable delivery guarantees.

use std::collections::BTreeMap;

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{Channel, ExchangeKind};
use tracing::info;

use crate::broker::{Broker, BrokerError};

/// Topic exchange carrying live event traffic.
pub const EVENTS_EXCHANGE: &str = "auction-events";
/// Direct exchange receiving permanently rejected messages.
pub const DEAD_LETTER_EXCHANGE: &str = "auction-events-dlx";
/// Queue collecting every dead-lettered message for operator inspection.
pub const DEAD_LETTER_QUEUE: &str = "auction-events-dlq";

/// Queue for auction creation events.
pub const AUCTION_CREATED_QUEUE: &str = "auction-created-events";
/// Queue for bid placement events.
pub const BID_PLACED_QUEUE: &str = "bid-placed-events";
/// Queue for auction completion events.
pub const AUCTION_FINISHED_QUEUE: &str = "auction-finished-events";

/// Routing key for auction creation.
pub const AUCTION_CREATED_KEY: &str = "auction.created";
/// Routing key for bid placement.
pub const BID_PLACED_KEY: &str = "auction.bid.placed";
/// Routing key for auction completion.
pub const AUCTION_FINISHED_KEY: &str = "auction.finished";

/// Routing key every dead-lettered message is re-published with.
///
/// The DLX is a direct exchange and matches binding keys literally, so a
/// dead-lettered message must not keep its original topic key. Every event
/// queue stamps this fixed key via `x-dead-letter-routing-key`, and the DLQ
/// is bound on exactly this key.
pub const DEAD_LETTER_KEY: &str = "dead-letter";

/// Queue name / routing key pairs bound to the live exchange.
pub const EVENT_QUEUES: [(&str, &str); 3] = [
    (AUCTION_CREATED_QUEUE, AUCTION_CREATED_KEY),
    (BID_PLACED_QUEUE, BID_PLACED_KEY),
    (AUCTION_FINISHED_QUEUE, AUCTION_FINISHED_KEY),
];

/// Argument pointing a queue at the dead-letter exchange.
const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Argument replacing the routing key when a message is dead-lettered.
const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// Errors raised while declaring the topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("failed to declare exchange '{name}': {source}")]
    Exchange {
        name: &'static str,
        source: lapin::Error,
    },

    #[error("failed to declare queue '{name}': {source}")]
    Queue {
        name: &'static str,
        source: lapin::Error,
    },

    #[error("failed to bind queue '{queue}' to exchange '{exchange}': {source}")]
    Bind {
        queue: &'static str,
        exchange: &'static str,
        source: lapin::Error,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Declare the full exchange/queue/binding graph.
///
/// Order matters: exchanges first, then the DLQ, then the per-category
/// queues that reference the DLX by name.
pub async fn initialize(broker: &Broker) -> Result<(), TopologyError> {
    let channel = broker.channel().await?;

    declare_exchange(&channel, EVENTS_EXCHANGE, ExchangeKind::Topic).await?;
    declare_exchange(&channel, DEAD_LETTER_EXCHANGE, ExchangeKind::Direct).await?;

    // DLQ catches every dead-lettered message regardless of origin queue:
    // all event queues stamp the same fixed dead-letter routing key.
    declare_queue(&channel, DEAD_LETTER_QUEUE, FieldTable::default()).await?;
    bind_queue(&channel, DEAD_LETTER_QUEUE, DEAD_LETTER_EXCHANGE, DEAD_LETTER_KEY).await?;

    for (queue, routing_key) in EVENT_QUEUES {
        declare_queue(&channel, queue, dead_letter_args()).await?;
        bind_queue(&channel, queue, EVENTS_EXCHANGE, routing_key).await?;
    }

    info!("Messaging topology initialized: exchanges, queues, and bindings declared");
    Ok(())
}

/// Arguments marking a queue as dead-lettering into the DLX on the fixed
/// dead-letter routing key.
fn dead_letter_args() -> FieldTable {
    let mut args: BTreeMap<ShortString, AMQPValue> = BTreeMap::new();
    args.insert(
        DEAD_LETTER_EXCHANGE_ARG.into(),
        AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
    );
    args.insert(
        DEAD_LETTER_ROUTING_KEY_ARG.into(),
        AMQPValue::LongString(DEAD_LETTER_KEY.into()),
    );
    FieldTable::from(args)
}

async fn declare_exchange(
    channel: &Channel,
    name: &'static str,
    kind: ExchangeKind,
) -> Result<(), TopologyError> {
    channel
        .exchange_declare(
            name,
            kind,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| TopologyError::Exchange { name, source })
}

async fn declare_queue(
    channel: &Channel,
    name: &'static str,
    arguments: FieldTable,
) -> Result<(), TopologyError> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            arguments,
        )
        .await
        .map(|_| ())
        .map_err(|source| TopologyError::Queue { name, source })
}

async fn bind_queue(
    channel: &Channel,
    queue: &'static str,
    exchange: &'static str,
    routing_key: &str,
) -> Result<(), TopologyError> {
    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|source| TopologyError::Bind {
            queue,
            exchange,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_queue_has_a_distinct_routing_key() {
        let mut keys: Vec<&str> = EVENT_QUEUES.iter().map(|(_, k)| *k).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), EVENT_QUEUES.len());
    }

    #[test]
    fn dead_letter_args_point_at_the_dlx() {
        let args = dead_letter_args();
        match args.inner().get(DEAD_LETTER_EXCHANGE_ARG) {
            Some(AMQPValue::LongString(s)) => {
                assert_eq!(s.as_bytes(), DEAD_LETTER_EXCHANGE.as_bytes());
            }
            other => panic!("expected LongString dlx argument, got {:?}", other),
        }
    }

    #[test]
    fn dead_letter_args_stamp_the_dlq_binding_key() {
        // The DLX is direct: the stamped routing key must equal the key the
        // DLQ is bound with, or dead-lettered messages become unroutable.
        let args = dead_letter_args();
        match args.inner().get(DEAD_LETTER_ROUTING_KEY_ARG) {
            Some(AMQPValue::LongString(s)) => {
                assert_eq!(s.as_bytes(), DEAD_LETTER_KEY.as_bytes());
            }
            other => panic!("expected LongString routing key argument, got {:?}", other),
        }
    }

    #[test]
    fn routing_keys_are_dot_delimited_hierarchies() {
        for (_, key) in EVENT_QUEUES {
            assert!(key.starts_with("auction."));
            assert!(!key.contains(' '));
        }
    }
}
