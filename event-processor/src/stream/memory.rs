use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::stream::{
    EventStream, PartitionCursor, PartitionError, RawEvent, ReceivedBatch, StreamError,
};

pub const MEMORY_TOPIC: &str = "orders";

/// In-process stream, used for local runs without a broker and throughout the tests.
///
/// Deliveries are handed out in the order they were pushed; a delivery larger than the
/// requested batch size is split across receive calls.
#[derive(Default)]
pub struct MemoryEventStream {
    deliveries: Mutex<VecDeque<Delivery>>,
    checkpoints: Mutex<Vec<PartitionCursor>>,
    receive_calls: AtomicUsize,
    fail_checkpoints: AtomicBool,
    close_when_drained: AtomicBool,
}

enum Delivery {
    Records(Vec<RawEvent>),
    Error(Option<i32>, String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue records that will be returned together by a single receive call
    pub fn push_batch(&self, records: Vec<RawEvent>) {
        lock(&self.deliveries).push_back(Delivery::Records(records));
    }

    /// Queue a non-fatal partition error
    pub fn push_error(&self, partition: Option<i32>, message: &str) {
        lock(&self.deliveries).push_back(Delivery::Error(partition, message.to_string()));
    }

    /// Once every queued delivery is consumed, receive fails with [`StreamError::Closed`]
    pub fn close_when_drained(&self) {
        self.close_when_drained.store(true, Ordering::SeqCst);
    }

    pub fn fail_checkpoints(&self, fail: bool) {
        self.fail_checkpoints.store(fail, Ordering::SeqCst);
    }

    pub fn checkpoints(&self) -> Vec<PartitionCursor> {
        lock(&self.checkpoints).clone()
    }

    /// Last committed offset per partition
    pub fn committed_offsets(&self) -> HashMap<i32, i64> {
        lock(&self.checkpoints)
            .iter()
            .map(|cursor| (cursor.partition, cursor.offset))
            .collect()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        lock(&self.deliveries).len()
    }
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn receive_batch(
        &self,
        max_batch_size: usize,
        max_wait: Duration,
    ) -> Result<ReceivedBatch, StreamError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);

        let next = {
            let mut deliveries = lock(&self.deliveries);
            match deliveries.pop_front() {
                Some(Delivery::Records(mut records)) if records.len() > max_batch_size => {
                    let rest = records.split_off(max_batch_size);
                    deliveries.push_front(Delivery::Records(rest));
                    Some(Delivery::Records(records))
                }
                other => other,
            }
        };

        match next {
            Some(Delivery::Records(records)) => Ok(ReceivedBatch {
                records,
                errors: vec![],
            }),
            Some(Delivery::Error(partition, message)) => Ok(ReceivedBatch {
                records: vec![],
                errors: vec![PartitionError {
                    partition,
                    error: StreamError::Other(message),
                }],
            }),
            None if self.close_when_drained.load(Ordering::SeqCst) => Err(StreamError::Closed),
            None => {
                tokio::time::sleep(max_wait).await;
                Ok(ReceivedBatch::default())
            }
        }
    }

    async fn update_checkpoint(&self, cursor: &PartitionCursor) -> Result<(), StreamError> {
        if self.fail_checkpoints.load(Ordering::SeqCst) {
            return Err(StreamError::Other(format!(
                "checkpoint store unavailable for partition {}",
                cursor.partition
            )));
        }
        lock(&self.checkpoints).push(cursor.clone());
        Ok(())
    }
}

/// Builds a record the way producers publish them: type and source as headers, JSON body.
pub fn json_record(partition: i32, offset: i64, event_type: &str, body: Value) -> RawEvent {
    let mut headers = HashMap::new();
    headers.insert("EventType".to_string(), event_type.to_string());
    headers.insert("Source".to_string(), "order-service".to_string());

    RawEvent {
        topic: MEMORY_TOPIC.to_string(),
        partition,
        offset,
        timestamp_ms: None,
        headers,
        payload: Some(body.to_string().into_bytes()),
    }
}

/// Builds a record with an arbitrary payload, e.g. one that is not valid JSON.
pub fn raw_record(partition: i32, offset: i64, event_type: &str, payload: &[u8]) -> RawEvent {
    let mut record = json_record(partition, offset, event_type, Value::Null);
    record.payload = Some(payload.to_vec());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_splits_oversized_deliveries() {
        let stream = MemoryEventStream::new();
        stream.push_batch(
            (0..5)
                .map(|offset| json_record(0, offset, "OrderCreated", json!({})))
                .collect(),
        );

        let first = stream
            .receive_batch(3, Duration::from_millis(1))
            .await
            .unwrap();
        let second = stream
            .receive_batch(3, Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(first.records.len(), 3);
        assert_eq!(second.records.len(), 2);
        assert_eq!(second.records[0].offset, 3);
        assert_eq!(stream.pending(), 0);
    }

    #[tokio::test]
    async fn test_empty_until_closed() {
        let stream = MemoryEventStream::new();

        let batch = stream
            .receive_batch(10, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(batch.is_empty());

        stream.close_when_drained();
        assert!(matches!(
            stream.receive_batch(10, Duration::from_millis(1)).await,
            Err(StreamError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_checkpoints_are_recorded() {
        let stream = MemoryEventStream::new();
        let cursor = PartitionCursor {
            topic: MEMORY_TOPIC.to_string(),
            partition: 2,
            offset: 41,
        };

        stream.update_checkpoint(&cursor).await.unwrap();
        assert_eq!(stream.checkpoints(), vec![cursor.clone()]);
        assert_eq!(cursor.next_offset(), 42);

        stream.fail_checkpoints(true);
        assert!(stream.update_checkpoint(&cursor).await.is_err());
        assert_eq!(stream.checkpoints().len(), 1);
    }
}
