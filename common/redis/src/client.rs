use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use tokio::time::timeout;

use crate::{Client, CustomRedisError};

const DEFAULT_REDIS_TIMEOUT_MILLISECS: u64 = 100;

fn get_redis_timeout_ms() -> u64 {
    std::env::var("REDIS_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_REDIS_TIMEOUT_MILLISECS)
}

#[derive(Clone)]
pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(RedisClient { connection })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.get(k);
        let fut: Result<Option<Vec<u8>>, RedisError> =
            timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;

        match fut? {
            Some(bytes) => Ok(String::from_utf8(bytes)?),
            None => Err(CustomRedisError::NotFound),
        }
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.set(k, v);
        let fut = timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.set_ex(k, v, seconds);
        let fut = timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn set_nx_ex(
        &self,
        k: String,
        v: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();

        // SET with both NX and EX options
        let result: Result<Option<String>, RedisError> = timeout(
            Duration::from_millis(get_redis_timeout_ms()),
            redis::cmd("SET")
                .arg(&k)
                .arg(&v)
                .arg("EX")
                .arg(seconds)
                .arg("NX")
                .query_async(&mut conn),
        )
        .await?;

        match result {
            Ok(Some(_)) => Ok(true), // Key was set successfully
            Ok(None) => Ok(false),   // Key already existed
            Err(e) => Err(e.into()),
        }
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.del(k);
        let fut: Result<(), RedisError> =
            timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn incr(&self, k: String, by: i64) -> Result<i64, CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.incr(k, by);
        let fut = timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn expire(&self, k: String, seconds: u64) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.expire(k, seconds as i64);
        let fut = timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn hincrby(
        &self,
        k: String,
        field: String,
        count: Option<i32>,
    ) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.hincr(k, field, count.unwrap_or(1));
        let fut: Result<(), RedisError> =
            timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn lpush(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.lpush(k, v);
        let fut: Result<(), RedisError> =
            timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn rpop(&self, k: String) -> Result<Option<String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.rpop(k, None);
        let fut = timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;
        Ok(fut?)
    }

    async fn llen(&self, k: String) -> Result<u64, CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.llen(k);
        let fut = timeout(Duration::from_millis(get_redis_timeout_ms()), results).await?;
        Ok(fut?)
    }
}
