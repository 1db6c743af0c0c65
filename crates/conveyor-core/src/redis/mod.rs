//! Redis backing layer shared by the durable store and broker

pub mod connection;

pub use connection::RedisPool;

/// Result type alias for Redis-layer operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Redis-specific error types
#[derive(Debug, thiserror::Error)]
pub enum RedisError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis operation failed: {0}")]
    Operation(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for RedisError {
    fn from(err: redis::RedisError) -> Self {
        RedisError::Operation(err.to_string())
    }
}

/// Key prefix shared by all conveyor keys to avoid collisions on a
/// shared Redis instance
#[derive(Debug, Clone)]
pub struct KeyPrefix {
    prefix: String,
}

impl KeyPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix a key
    pub fn key(&self, key: impl AsRef<str>) -> String {
        format!("{}:{}", self.prefix, key.as_ref())
    }

    /// Prefix a per-queue key
    pub fn queue_key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:q:{}:{}", self.prefix, queue, suffix)
    }
}

impl Default for KeyPrefix {
    fn default() -> Self {
        Self::new("conveyor")
    }
}
