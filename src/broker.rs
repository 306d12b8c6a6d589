//! Message-broker adapter contract.
//!
//! The core never talks to a concrete broker; call sites are written against
//! this trait and the surrounding application plugs in the real client. Queue
//! items are opaque JSON values; the core does not validate payloads.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ServiceError;

/// Primary work queue for detection jobs.
pub const DETECTION_QUEUE: &str = "detection_queue";
/// Primary work queue for risk-analysis jobs.
pub const ANALYSIS_QUEUE: &str = "analysis_queue";

/// Dead-letter queue name for `queue`. Names already carrying the `dlq:`
/// prefix are used verbatim.
pub fn dlq_name(queue: &str) -> String {
    if queue.starts_with("dlq:") {
        queue.to_string()
    } else {
        format!("dlq:{queue}")
    }
}

/// What the broker should do when a queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Move overflowed items to the queue's DLQ.
    Dlq,
    /// Reject the enqueue outright.
    Reject,
}

/// Outcome of a bounded enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub success: bool,
    pub queue_length: usize,
    pub had_backpressure: bool,
    pub moved_to_dlq_count: usize,
    pub error: Option<String>,
}

impl EnqueueReceipt {
    pub fn accepted(queue_length: usize) -> Self {
        Self { success: true, queue_length, ..Self::default() }
    }

    pub fn rejected(queue_length: usize, error: impl Into<String>) -> Self {
        Self { success: false, queue_length, error: Some(error.into()), ..Self::default() }
    }
}

/// Typed queue interface consumed by the resilience core.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue with overflow accounting; never silently drops.
    async fn safe_enqueue(
        &self,
        queue: &str,
        item: Value,
        policy: OverflowPolicy,
    ) -> Result<EnqueueReceipt, ServiceError>;

    /// Blocking pop with a timeout; `None` when the queue stayed empty.
    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Value>, ServiceError>;

    /// Pop without waiting; `None` when the queue is empty.
    async fn nonblocking_pop(&self, queue: &str) -> Result<Option<Value>, ServiceError>;

    async fn queue_length(&self, queue: &str) -> Result<usize, ServiceError>;

    /// Read up to `limit` items without removing them.
    async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<Value>, ServiceError>;

    /// Delete all items in `queue`; `true` if the queue existed.
    async fn clear(&self, queue: &str) -> Result<bool, ServiceError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), ServiceError>;
}
