//! Per-queue consumer engine.
//!
//! One engine drives one queue: it subscribes with a bounded prefetch,
//! decodes each delivery's envelope, dispatches to the handler registered
//! for the `event-type` discriminator, and settles the message according to
//! the retry policy. Per-message state machine:
//!
//! ```text
//! Received -> Dispatched -> { Acked | RequeuedForRetry | DeadLettered }
//! ```
//!
//! Retry accounting is header-based. The broker does not carry a mutated
//! header across nack-with-requeue, so a retryable failure is settled by
//! republishing the message to its own queue with an incremented
//! `x-retry-count` and acking the original delivery. Permanent failures
//! (malformed payloads, unknown event types) are nacked without requeue and
//! land in the DLQ via the queue's dead-letter-exchange argument.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{Broker, BrokerError};
use crate::envelope::{self, DeliveryMeta};
use crate::handlers::{EventHandler, HandlerError};

/// Errors raised while starting a consumer.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to set up consumer on '{queue}': {source}")]
    Setup { queue: String, source: lapin::Error },
}

/// Tunables for a consumer engine.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum unacknowledged messages held in flight (flow control).
    pub prefetch: u16,
    /// Redeliveries granted to a recoverable failure before dead-lettering.
    pub max_retries: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            max_retries: 3,
        }
    }
}

/// Terminal settlement for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Permanently remove the message.
    Ack,
    /// Re-stamp onto the queue with the incremented retry counter.
    Retry { next_retry: u32 },
    /// Nack without requeue; the DLX routes it to the DLQ.
    DeadLetter,
}

/// Map a handler outcome and the delivery's retry count onto a settlement.
pub(crate) fn disposition(
    result: &Result<(), HandlerError>,
    retry_count: u32,
    max_retries: u32,
) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(e) if e.is_permanent() => Disposition::DeadLetter,
        Err(_) if retry_count < max_retries => Disposition::Retry {
            next_retry: retry_count + 1,
        },
        Err(_) => Disposition::DeadLetter,
    }
}

/// Long-running consumption driver for a single queue.
///
/// Register handlers, then `start()`; `stop()` closes the channel after the
/// in-flight message finishes. Unacked messages stay on the broker and are
/// redelivered to the next consumer instance.
pub struct ConsumerEngine {
    broker: Arc<Broker>,
    queue: String,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    config: ConsumerConfig,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerEngine {
    pub fn new(broker: Arc<Broker>, queue: impl Into<String>, config: ConsumerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            queue: queue.into(),
            handlers: HashMap::new(),
            config,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Register the handler for one `event-type` discriminator.
    pub fn register(&mut self, event_type: &str, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.insert(event_type.to_string(), handler);
        self
    }

    /// Subscribe and spawn the consumption loop.
    ///
    /// The initial subscription must succeed; later connection losses are
    /// handled by reconnecting with backoff inside the loop.
    pub async fn start(&self) -> Result<(), ConsumeError> {
        let initial = setup(&self.broker, &self.queue, self.config.prefetch).await?;

        let worker = Worker {
            broker: Arc::clone(&self.broker),
            queue: self.queue.clone(),
            handlers: Arc::new(self.handlers.clone()),
            prefetch: self.config.prefetch,
            max_retries: self.config.max_retries,
        };
        let shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(worker.run(initial, shutdown_rx));
        *self.task.lock().expect("consumer task lock poisoned") = Some(handle);

        Ok(())
    }

    /// Stop pulling messages and close the channel cleanly.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .task
            .lock()
            .expect("consumer task lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(queue = %self.queue, "Consumer stopped");
    }

    /// Queue this engine consumes from.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// Owned state moved into the spawned consumption loop.
struct Worker {
    broker: Arc<Broker>,
    queue: String,
    handlers: Arc<HashMap<String, Arc<dyn EventHandler>>>,
    prefetch: u16,
    max_retries: u32,
}

impl Worker {
    /// Consumption loop with reconnect-and-backoff on stream failure.
    async fn run(
        self,
        initial: (Channel, lapin::Consumer),
        mut shutdown: watch::Receiver<bool>,
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();

        let mut current = Some(initial);

        loop {
            let (channel, mut consumer) = match current.take() {
                Some(pair) => pair,
                None => match setup(&self.broker, &self.queue, self.prefetch).await {
                    Ok(pair) => {
                        backoff_iter = backoff_builder.build();
                        pair
                    }
                    Err(e) => {
                        let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                        error!(
                            queue = %self.queue,
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            "Failed to set up consumer, retrying after backoff"
                        );
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                },
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        let _ = channel.close(200, "consumer stopped").await;
                        return;
                    }
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => {
                            self.process_delivery(&channel, delivery).await;
                        }
                        Some(Err(e)) => {
                            error!(queue = %self.queue, error = %e, "Consumer delivery error, will reconnect");
                            break;
                        }
                        None => {
                            info!(queue = %self.queue, "Consumer stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Dispatch one delivery and settle it. Never drops a message without
    /// an ack or nack.
    async fn process_delivery(&self, channel: &Channel, delivery: Delivery) {
        let meta = envelope::extract_meta(&delivery.properties);

        let span = tracing::info_span!(
            "bus.consume",
            queue = %self.queue,
            event_type = meta.event_type.as_deref().unwrap_or("unknown"),
            correlation_id = meta.correlation_id.as_deref().unwrap_or(""),
            retry_count = meta.retry_count,
        );

        #[cfg(feature = "otel")]
        envelope::set_span_parent(&delivery.properties, &span);

        let handlers = Arc::clone(&self.handlers);
        let max_retries = self.max_retries;
        let queue = self.queue.clone();

        async move {
            debug!("Received event");

            let result = match AssertUnwindSafe(dispatch(&handlers, &delivery.data, &meta))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    // A panicking handler is a bug; dead-letter rather than
                    // risk a hot redelivery loop.
                    error!("Handler panicked, dead-lettering message");
                    nack_to_dlq(&delivery).await;
                    return;
                }
            };

            match disposition(&result, meta.retry_count, max_retries) {
                Disposition::Ack => {
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        error!(error = %e, "Failed to ack message");
                    } else {
                        info!("Message processed successfully and acknowledged");
                    }
                }
                Disposition::Retry { next_retry } => {
                    requeue_with_retry(channel, &queue, &delivery, next_retry, max_retries).await;
                }
                Disposition::DeadLetter => {
                    let reason = result
                        .err()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unspecified".to_string());
                    error!(
                        reason = %reason,
                        retry_count = meta.retry_count,
                        "Message failed permanently, sending to DLQ"
                    );
                    nack_to_dlq(&delivery).await;
                }
            }
        }
        .instrument(span)
        .await;
    }
}

/// Look up the handler for the delivery's discriminator and run it.
fn dispatch<'a>(
    handlers: &'a HashMap<String, Arc<dyn EventHandler>>,
    body: &'a [u8],
    meta: &'a DeliveryMeta,
) -> futures::future::BoxFuture<'a, Result<(), HandlerError>> {
    match meta.event_type.as_deref().and_then(|t| handlers.get(t)) {
        Some(handler) => handler.handle(body, meta),
        None => {
            let missing = meta
                .event_type
                .clone()
                .unwrap_or_else(|| "<missing event-type header>".to_string());
            Box::pin(async move { Err(HandlerError::UnknownEventType(missing)) })
        }
    }
}

/// Re-stamp the message onto its own queue with the incremented retry
/// counter, then ack the original. Falls back to a plain nack-with-requeue
/// when the republish itself fails.
async fn requeue_with_retry(
    channel: &Channel,
    queue: &str,
    delivery: &Delivery,
    next_retry: u32,
    max_retries: u32,
) {
    let properties = envelope::stamp_retry(&delivery.properties, next_retry);

    let republished = channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            &delivery.data,
            properties,
        )
        .await;

    match republished {
        Ok(_) => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, "Failed to ack original after retry republish");
            } else {
                warn!(
                    retry = next_retry,
                    max_retries, "Message processing failed, requeued for retry"
                );
            }
        }
        Err(e) => {
            warn!(error = %e, "Retry republish failed, falling back to broker requeue");
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                error!(error = %e, "Failed to nack message for requeue");
            }
        }
    }
}

/// Nack without requeue; the queue's dead-letter-exchange argument routes
/// the message to the DLQ.
async fn nack_to_dlq(delivery: &Delivery) {
    if let Err(e) = delivery
        .nack(BasicNackOptions {
            requeue: false,
            ..Default::default()
        })
        .await
    {
        error!(error = %e, "Failed to nack message to DLQ");
    }
}

/// Open a channel, apply prefetch, and begin consuming.
async fn setup(
    broker: &Broker,
    queue: &str,
    prefetch: u16,
) -> Result<(Channel, lapin::Consumer), ConsumeError> {
    let channel = broker.channel().await?;

    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|source| ConsumeError::Setup {
            queue: queue.to_string(),
            source,
        })?;

    let consumer = channel
        .basic_consume(
            queue,
            &format!("{queue}-consumer"),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|source| ConsumeError::Setup {
            queue: queue.to_string(),
            source,
        })?;

    info!(queue = %queue, prefetch, "Consumer subscribed");

    Ok((channel, consumer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> Result<(), HandlerError> {
        Err(HandlerError::Failed("downstream unavailable".to_string()))
    }

    fn permanent() -> Result<(), HandlerError> {
        Err(HandlerError::UnknownEventType("Nope".to_string()))
    }

    #[test]
    fn success_acks() {
        assert_eq!(disposition(&Ok(()), 0, 3), Disposition::Ack);
        // Even a message that exhausted retries earlier acks on success.
        assert_eq!(disposition(&Ok(()), 3, 3), Disposition::Ack);
    }

    #[test]
    fn transient_failure_retries_with_incremented_counter() {
        assert_eq!(
            disposition(&transient(), 0, 3),
            Disposition::Retry { next_retry: 1 }
        );
        assert_eq!(
            disposition(&transient(), 2, 3),
            Disposition::Retry { next_retry: 3 }
        );
    }

    #[test]
    fn transient_failure_dead_letters_after_budget() {
        assert_eq!(disposition(&transient(), 3, 3), Disposition::DeadLetter);
        assert_eq!(disposition(&transient(), 7, 3), Disposition::DeadLetter);
    }

    #[test]
    fn permanent_failure_skips_the_retry_path() {
        assert_eq!(disposition(&permanent(), 0, 3), Disposition::DeadLetter);

        let malformed = HandlerError::Malformed {
            event_type: "AuctionCreatedEvent",
            source: serde_json::from_slice::<serde_json::Value>(b"x").unwrap_err(),
        };
        assert_eq!(disposition(&Err(malformed), 0, 3), Disposition::DeadLetter);
    }

    #[test]
    fn a_failing_message_is_delivered_max_retries_plus_one_times() {
        // First delivery carries retry_count 0; each retry bumps it. With a
        // budget of 3 the handler runs 4 times, then the message dead-letters.
        let max_retries: u32 = 3;
        let mut deliveries: u32 = 0;
        let mut retry_count: u32 = 0;
        loop {
            deliveries += 1;
            match disposition(&transient(), retry_count, max_retries) {
                Disposition::Retry { next_retry } => retry_count = next_retry,
                Disposition::DeadLetter => break,
                Disposition::Ack => unreachable!(),
            }
        }
        assert_eq!(deliveries, max_retries + 1);
    }

    #[test]
    fn default_config_matches_the_flow_control_contract() {
        let config = ConsumerConfig::default();
        assert_eq!(config.prefetch, 10);
        assert_eq!(config.max_retries, 3);
    }
}
