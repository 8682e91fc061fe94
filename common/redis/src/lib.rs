use async_trait::async_trait;
use redis::RedisError;
use thiserror::Error;

mod client;
mod mock;

pub use client::RedisClient;
pub use mock::MockRedisClient;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Redis error: {0}")]
    Other(String),
    #[error("Timeout error")]
    Timeout,
}

impl From<RedisError> for CustomRedisError {
    fn from(err: RedisError) -> Self {
        CustomRedisError::Other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CustomRedisError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CustomRedisError::Timeout
    }
}

impl From<std::string::FromUtf8Error> for CustomRedisError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        CustomRedisError::ParseError(err.to_string())
    }
}

/// The cache operations the plugin server needs: plain UTF-8 key/value with
/// expirations, atomic counters, `SET NX EX` + `EXPIRE` for distributed
/// locks, and list push/pop for the legacy celery-shaped job queue.
#[async_trait]
pub trait Client: Send + Sync {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError>;
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError>;
    /// Set only if the key does not exist, with a TTL. Returns whether the
    /// key was set. This is the lock-acquisition primitive.
    async fn set_nx_ex(&self, k: String, v: String, seconds: u64)
        -> Result<bool, CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
    async fn incr(&self, k: String, by: i64) -> Result<i64, CustomRedisError>;
    /// Reset a key's TTL. Returns false if the key does not exist. This is
    /// the lock-extension primitive.
    async fn expire(&self, k: String, seconds: u64) -> Result<bool, CustomRedisError>;
    async fn hincrby(
        &self,
        k: String,
        field: String,
        count: Option<i32>,
    ) -> Result<(), CustomRedisError>;
    async fn lpush(&self, k: String, v: String) -> Result<(), CustomRedisError>;
    async fn rpop(&self, k: String) -> Result<Option<String>, CustomRedisError>;
    async fn llen(&self, k: String) -> Result<u64, CustomRedisError>;
}
