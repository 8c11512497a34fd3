//! Process-wide broker connection resource.
//!
//! One `Broker` is constructed at startup and closed at shutdown.
//! Publishers and consumers borrow short-lived channels from it instead of
//! holding connection state of their own. Construction verifies
//! connectivity and fails fast; the process never runs with a latent dead
//! connection.

use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{Channel, ConnectionProperties};
use tracing::info;

/// Maximum broker connections held by the pool. Channels are cheap and
/// created per operation; connections are not.
const POOL_SIZE: usize = 4;

/// Errors raised by the broker connection layer.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to broker at {url}: {message}")]
    Connect { url: String, message: String },

    #[error("failed to open channel: {0}")]
    Channel(String),
}

/// Long-lived, process-owned handle to the message broker.
pub struct Broker {
    pool: Pool,
    url: String,
}

impl Broker {
    /// Connect to the broker and verify the connection is usable.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let manager = Manager::new(url.to_string(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| BrokerError::Connect {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        // Fail fast: a broker we cannot reach at startup is a startup error,
        // not a deferred null resource.
        pool.get().await.map_err(|e: PoolError| BrokerError::Connect {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        info!(url = %url, "Connected to AMQP broker");

        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    /// Open a fresh channel over a pooled connection.
    pub async fn channel(&self) -> Result<Channel, BrokerError> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e: PoolError| BrokerError::Channel(e.to_string()))?;

        conn.create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    /// Broker URL this handle was built from.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Tear down all pooled connections. In-flight unacked messages remain
    /// on the broker and will be redelivered.
    pub fn close(&self) {
        self.pool.close();
        info!(url = %self.url, "Closed AMQP broker connections");
    }
}
