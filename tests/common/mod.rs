//! Shared test support: an in-memory broker with failure injection.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nightwatch::{Broker, EnqueueReceipt, OverflowPolicy, ServiceError};
use serde_json::Value;

/// In-memory [`Broker`] with two failure modes: `down` (every call errors
/// like a dead connection) and `reject_enqueues` (enqueues return
/// unsuccessful receipts, e.g. a full queue).
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
    down: AtomicBool,
    reject_enqueues: AtomicBool,
    enqueue_calls: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_reject_enqueues(&self, reject: bool) {
        self.reject_enqueues.store(reject, Ordering::SeqCst);
    }

    /// Number of `safe_enqueue` calls that reached the broker.
    pub fn enqueue_calls(&self) -> usize {
        self.enqueue_calls.load(Ordering::SeqCst)
    }

    /// Current contents of a queue, oldest first.
    pub fn items(&self, queue: &str) -> Vec<Value> {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn check_up(&self) -> Result<(), ServiceError> {
        if self.down.load(Ordering::SeqCst) {
            Err(ServiceError::Broker("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn safe_enqueue(
        &self,
        queue: &str,
        item: Value,
        _policy: OverflowPolicy,
    ) -> Result<EnqueueReceipt, ServiceError> {
        self.check_up()?;
        self.enqueue_calls.fetch_add(1, Ordering::SeqCst);

        let mut queues = self.queues.lock().unwrap();
        let entries = queues.entry(queue.to_string()).or_default();
        if self.reject_enqueues.load(Ordering::SeqCst) {
            return Ok(EnqueueReceipt::rejected(entries.len(), "queue full"));
        }
        entries.push_back(item);
        Ok(EnqueueReceipt::accepted(entries.len()))
    }

    async fn dequeue(&self, queue: &str, _timeout: Duration) -> Result<Option<Value>, ServiceError> {
        self.nonblocking_pop(queue).await
    }

    async fn nonblocking_pop(&self, queue: &str) -> Result<Option<Value>, ServiceError> {
        self.check_up()?;
        Ok(self.queues.lock().unwrap().get_mut(queue).and_then(|q| q.pop_front()))
    }

    async fn queue_length(&self, queue: &str) -> Result<usize, ServiceError> {
        self.check_up()?;
        Ok(self.queues.lock().unwrap().get(queue).map(|q| q.len()).unwrap_or(0))
    }

    async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<Value>, ServiceError> {
        self.check_up()?;
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, queue: &str) -> Result<bool, ServiceError> {
        self.check_up()?;
        Ok(self.queues.lock().unwrap().remove(queue).is_some())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        self.check_up()
    }
}
