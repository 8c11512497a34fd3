//! auction-worker: hosts the event consumers.
//!
//! Connects to the broker (fail-fast), declares the messaging topology,
//! then runs one consumer engine per event queue until a shutdown signal
//! arrives.
//!
//! ## Configuration
//! - `AUCTION_BUS_CONFIG`: path to a YAML config file
//! - `AUCTION__MESSAGING__URL`: AMQP connection string
//! - `AUCTION_LOG`: tracing filter (default: info)

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auction_bus::broker::Broker;
use auction_bus::config::{Config, LOG_ENV_VAR};
use auction_bus::consumer::ConsumerEngine;
use auction_bus::events::{AuctionCreatedEvent, AuctionFinishedEvent, BidPlacedEvent, DomainEvent};
use auction_bus::handlers::{AuctionCreatedHandler, AuctionFinishedHandler, BidPlacedHandler};
use auction_bus::idempotency::InMemoryProcessedStore;
use auction_bus::topology::{
    self, AUCTION_CREATED_QUEUE, AUCTION_FINISHED_QUEUE, BID_PLACED_QUEUE,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting auction-worker");

    // A broker we cannot reach is a startup error; supervision restarts us.
    let broker = Arc::new(Broker::connect(&config.messaging.url).await?);

    // Consuming without confirmed durable topology would silently drop the
    // delivery guarantees, so this is fatal too.
    topology::initialize(&broker).await?;

    let store = Arc::new(InMemoryProcessedStore::new());
    let consumer_config = config.messaging.consumer();

    // One engine per queue from the configured list; no list means all.
    let mut engines = Vec::new();

    if config.messaging.runs_queue(AUCTION_CREATED_QUEUE) {
        let mut engine = ConsumerEngine::new(
            Arc::clone(&broker),
            AUCTION_CREATED_QUEUE,
            consumer_config.clone(),
        );
        engine.register(
            AuctionCreatedEvent::EVENT_TYPE,
            Arc::new(AuctionCreatedHandler::new(store.clone())),
        );
        engines.push(engine);
    }

    if config.messaging.runs_queue(AUCTION_FINISHED_QUEUE) {
        let mut engine = ConsumerEngine::new(
            Arc::clone(&broker),
            AUCTION_FINISHED_QUEUE,
            consumer_config.clone(),
        );
        engine.register(
            AuctionFinishedEvent::EVENT_TYPE,
            Arc::new(AuctionFinishedHandler::new(store.clone())),
        );
        engines.push(engine);
    }

    if config.messaging.runs_queue(BID_PLACED_QUEUE) {
        let mut engine =
            ConsumerEngine::new(Arc::clone(&broker), BID_PLACED_QUEUE, consumer_config.clone());
        engine.register(
            BidPlacedEvent::EVENT_TYPE,
            Arc::new(BidPlacedHandler::new(store.clone())),
        );
        engines.push(engine);
    }

    if engines.is_empty() {
        error!("Configured queue list matches no known event queue");
        return Err("no consumers to run".into());
    }

    for engine in &engines {
        engine.start().await?;
        info!(queue = %engine.queue(), "Consumer running");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping consumers");

    for engine in &engines {
        engine.stop().await;
    }
    broker.close();

    Ok(())
}
