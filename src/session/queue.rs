//! Decoupling queue backends
//!
//! Lists are keyed by name (`input_<id>` / `output_<id>`). Producers push to
//! the tail, consumers pop from the head in bounded batches. Items are opaque
//! one-line strings.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::{ExecError, ExecResult};

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Pop up to `max` items from the head of `key`, oldest first
    async fn pop_batch(&self, key: &str, max: usize) -> ExecResult<Vec<String>>;

    /// Append one item to the tail of `key`
    async fn push(&self, key: &str, item: &str) -> ExecResult<()>;
}

/// Redis lists over an auto-reconnecting connection
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub async fn connect(client: &redis::Client) -> ExecResult<Self> {
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        Ok(Self { conn })
    }
}

fn unavailable(e: redis::RedisError) -> ExecError {
    ExecError::QueueUnavailable(e.to_string())
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn pop_batch(&self, key: &str, max: usize) -> ExecResult<Vec<String>> {
        let Some(count) = NonZeroUsize::new(max) else {
            return Ok(Vec::new());
        };
        let mut conn = self.conn.clone();
        let items: Option<Vec<String>> = conn.lpop(key, Some(count)).await.map_err(unavailable)?;
        Ok(items.unwrap_or_default())
    }

    async fn push(&self, key: &str, item: &str) -> ExecResult<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, item).await.map_err(unavailable)
    }
}

/// In-process lists, for single-process deployments and tests
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    lists: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self {
            lists: Arc::default(),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going away (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Copy of the list under `key`
    pub fn snapshot(&self, key: &str) -> Vec<String> {
        self.lists()
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, key: &str) -> usize {
        self.lists().get(key).map_or(0, VecDeque::len)
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> ExecResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ExecError::QueueUnavailable("memory queue offline".to_string()))
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn pop_batch(&self, key: &str, max: usize) -> ExecResult<Vec<String>> {
        self.check_available()?;
        let mut lists = self.lists();
        let Some(list) = lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let take = max.min(list.len());
        let items = list.drain(..take).collect();
        if list.is_empty() {
            lists.remove(key);
        }
        Ok(items)
    }

    async fn push(&self, key: &str, item: &str) -> ExecResult<()> {
        self.check_available()?;
        self.lists()
            .entry(key.to_string())
            .or_default()
            .push_back(item.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_fifo_batches() {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            assert_ok!(queue.push("input_q", &i.to_string()).await);
        }

        assert_eq!(queue.pop_batch("input_q", 3).await.unwrap(), vec!["0", "1", "2"]);
        assert_eq!(queue.pop_batch("input_q", 3).await.unwrap(), vec!["3", "4"]);
        assert!(queue.pop_batch("input_q", 3).await.unwrap().is_empty());
        assert_eq!(queue.len("input_q"), 0);
    }

    #[tokio::test]
    async fn test_zero_batch_is_empty() {
        let queue = MemoryQueue::new();
        queue.push("k", "x").await.unwrap();
        assert!(queue.pop_batch("k", 0).await.unwrap().is_empty());
        assert_eq!(queue.snapshot("k"), vec!["x"]);
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let queue = MemoryQueue::new();
        queue.set_available(false);

        let err = assert_err!(queue.push("k", "x").await);
        assert!(err.is_transient());
        assert_err!(queue.pop_batch("k", 1).await);

        queue.set_available(true);
        assert_ok!(queue.push("k", "x").await);
        assert_eq!(queue.len("k"), 1);
    }
}
