use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{Client, CustomRedisError};

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    // tokio's Instant so paused-clock tests can advance expiry with the runtime
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, i64>>,
    calls: Vec<(String, String)>,
}

/// An in-memory stand-in for redis, honouring expirations and the NX
/// semantics the lock coordinator depends on. Shared freely across clones.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    state: Arc<Mutex<State>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every (op, key) pair seen so far, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.lock().calls.clone()
    }

    /// Direct peek for assertions, ignoring expiry.
    pub fn peek(&self, k: &str) -> Option<String> {
        self.lock().strings.get(k).map(|e| e.value.clone())
    }

    pub fn list_len(&self, k: &str) -> usize {
        self.lock().lists.get(k).map(|l| l.len()).unwrap_or(0)
    }

    fn record(state: &mut State, op: &str, key: &str) {
        state.calls.push((op.to_string(), key.to_string()));
    }

    fn live_value(state: &mut State, k: &str) -> Option<String> {
        match state.strings.get(k) {
            Some(entry) if entry.is_live() => Some(entry.value.clone()),
            Some(_) => {
                state.strings.remove(k);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "get", &k);
        Self::live_value(&mut state, &k).ok_or(CustomRedisError::NotFound)
    }

    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "set", &k);
        state.strings.insert(
            k,
            Entry {
                value: v,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "setex", &k);
        state.strings.insert(
            k,
            Entry {
                value: v,
                expires_at: Some(Instant::now() + Duration::from_secs(seconds)),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        k: String,
        v: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "set_nx_ex", &k);
        if Self::live_value(&mut state, &k).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            k,
            Entry {
                value: v,
                expires_at: Some(Instant::now() + Duration::from_secs(seconds)),
            },
        );
        Ok(true)
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "del", &k);
        state.strings.remove(&k);
        state.lists.remove(&k);
        state.hashes.remove(&k);
        Ok(())
    }

    async fn incr(&self, k: String, by: i64) -> Result<i64, CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "incr", &k);
        let current = Self::live_value(&mut state, &k)
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|e| CustomRedisError::ParseError(e.to_string()))
            })
            .transpose()?
            .unwrap_or(0);
        let next = current + by;
        state.strings.insert(
            k,
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn expire(&self, k: String, seconds: u64) -> Result<bool, CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "expire", &k);
        if Self::live_value(&mut state, &k).is_none() {
            return Ok(false);
        }
        if let Some(entry) = state.strings.get_mut(&k) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(true)
    }

    async fn hincrby(
        &self,
        k: String,
        field: String,
        count: Option<i32>,
    ) -> Result<(), CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "hincrby", &k);
        *state
            .hashes
            .entry(k)
            .or_default()
            .entry(field)
            .or_insert(0) += count.unwrap_or(1) as i64;
        Ok(())
    }

    async fn lpush(&self, k: String, v: String) -> Result<(), CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "lpush", &k);
        state.lists.entry(k).or_default().push_front(v);
        Ok(())
    }

    async fn rpop(&self, k: String) -> Result<Option<String>, CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "rpop", &k);
        Ok(state.lists.get_mut(&k).and_then(|l| l.pop_back()))
    }

    async fn llen(&self, k: String) -> Result<u64, CustomRedisError> {
        let mut state = self.lock();
        Self::record(&mut state, "llen", &k);
        Ok(state.lists.get(&k).map(|l| l.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nx_respects_existing_keys() {
        let client = MockRedisClient::new();
        assert!(client
            .set_nx_ex("lock".to_string(), "a".to_string(), 60)
            .await
            .unwrap());
        assert!(!client
            .set_nx_ex("lock".to_string(), "b".to_string(), 60)
            .await
            .unwrap());
        assert_eq!(client.get("lock".to_string()).await.unwrap(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_with_the_clock() {
        let client = MockRedisClient::new();
        client
            .setex("k".to_string(), "v".to_string(), 10)
            .await
            .unwrap();
        assert_eq!(client.get("k".to_string()).await.unwrap(), "v");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            client.get("k".to_string()).await,
            Err(CustomRedisError::NotFound)
        );
        // An expired lock is acquirable again
        assert!(client
            .set_nx_ex("k".to_string(), "w".to_string(), 10)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn lists_are_fifo_through_lpush_rpop() {
        let client = MockRedisClient::new();
        client
            .lpush("q".to_string(), "first".to_string())
            .await
            .unwrap();
        client
            .lpush("q".to_string(), "second".to_string())
            .await
            .unwrap();
        assert_eq!(client.llen("q".to_string()).await.unwrap(), 2);
        assert_eq!(
            client.rpop("q".to_string()).await.unwrap(),
            Some("first".to_string())
        );
        assert_eq!(
            client.rpop("q".to_string()).await.unwrap(),
            Some("second".to_string())
        );
        assert_eq!(client.rpop("q".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_starts_from_zero() {
        let client = MockRedisClient::new();
        assert_eq!(client.incr("c".to_string(), 2).await.unwrap(), 2);
        assert_eq!(client.incr("c".to_string(), 3).await.unwrap(), 5);
    }
}
