//! Redis connection management
//!
//! Wraps `redis::aio::ConnectionManager` with an initial
//! connect-with-retry loop. The manager handles reconnection after
//! transient drops; operations during an outage fail fast and surface as
//! `STORE_UNAVAILABLE` / `BROKER_UNAVAILABLE` to the caller.

use crate::config::RedisSettings;
use crate::redis::{RedisError, RedisResult};
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{error, info};

/// Shared Redis connection handle
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
    url: String,
}

impl RedisPool {
    /// Connect to Redis, retrying up to `settings.max_retries` times
    pub async fn connect(settings: &RedisSettings) -> RedisResult<Self> {
        let client = Client::open(settings.url.as_str())
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        let mut attempt = 0;
        let manager = loop {
            attempt += 1;
            match ConnectionManager::new(client.clone()).await {
                Ok(manager) => break manager,
                Err(e) => {
                    error!(attempt, error = %e, "redis connection attempt failed");
                    if attempt >= settings.max_retries {
                        return Err(RedisError::Connection(format!(
                            "failed to connect after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    tokio::time::sleep(settings.retry_delay()).await;
                }
            }
        };

        info!(url = %settings.url, "redis pool connected");

        Ok(Self {
            manager,
            url: settings.url.clone(),
        })
    }

    /// Clone the managed connection for one operation
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool").field("url", &self.url).finish()
    }
}
