//! Event-driven messaging core for the auction platform.
//!
//! Decouples write-side domain mutations (auction creation, bid placement)
//! from downstream consumers over a topic-exchange broker with durable
//! queues, dead-lettering, bounded retries, and idempotent consumption.
//!
//! Data flow: a command handler completes a write, then calls
//! [`publisher::EventPublisher::publish`]; the topology routes the event by
//! key to one or more durable queues; each queue's
//! [`consumer::ConsumerEngine`] dispatches decoded events to registered
//! [`handlers::EventHandler`]s and translates their outcomes into ack,
//! retry, or dead-letter.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod events;
pub mod handlers;
pub mod idempotency;
pub mod publisher;
pub mod topology;
