//! Stream client boundary: batch receive plus per-partition checkpoints.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod kafka;
pub mod memory;

pub use kafka::KafkaEventStream;
pub use memory::MemoryEventStream;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("stream closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// An undecoded record as delivered by the stream, owned so it can outlive the consumer poll.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub headers: HashMap<String, String>,
    pub payload: Option<Vec<u8>>,
}

impl RawEvent {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Stream-assigned identity, unique per topic/partition/offset
    pub fn stream_id(&self) -> String {
        format!("{}-{}-{}", self.topic, self.partition, self.offset)
    }
}

/// Progress marker for one partition: everything up to and including `offset` was handled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionCursor {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl PartitionCursor {
    /// The offset a consumer restarting from this cursor should read next
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

/// A non-fatal error the stream client attributed to a partition (or to no partition at all).
#[derive(Debug)]
pub struct PartitionError {
    pub partition: Option<i32>,
    pub error: StreamError,
}

/// What a single receive call produced. Records keep their arrival order.
#[derive(Debug, Default)]
pub struct ReceivedBatch {
    pub records: Vec<RawEvent>,
    pub errors: Vec<PartitionError>,
}

impl ReceivedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }
}

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Waits at most `max_wait` for up to `max_batch_size` records. An empty batch is not an error.
    /// Returns Err only for fatal conditions that should stop the intake loop.
    async fn receive_batch(
        &self,
        max_batch_size: usize,
        max_wait: Duration,
    ) -> Result<ReceivedBatch, StreamError>;

    /// Durably records that every record up to the cursor has been handled.
    async fn update_checkpoint(&self, cursor: &PartitionCursor) -> Result<(), StreamError>;
}
