//! The intake loop: receive a batch, fan it out per partition, checkpoint each partition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::health::{ComponentStatus, HealthHandle};
use crate::metrics_consts::{
    BATCH_SIZE, CHECKPOINTS, ERROR_CHECKPOINT, ERROR_CONSUMER, ERROR_PARTITION,
    EVENT_PROCESSING_ERRORS, PROCESSOR_RUNNING,
};
use crate::pipeline::EventPipeline;
use crate::stream::{EventStream, PartitionCursor, RawEvent, ReceivedBatch, StreamError};

#[derive(Debug, Clone, Copy)]
pub struct IntakeSettings {
    pub max_batch_size: usize,
    pub max_wait: Duration,
}

/// Per-partition result of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: i32,
    pub processed: usize,
    pub failed: usize,
    pub checkpointed: bool,
}

#[derive(Clone)]
pub struct IntakeLoop {
    stream: Arc<dyn EventStream>,
    pipeline: EventPipeline,
    settings: IntakeSettings,
    liveness: Option<HealthHandle>,
}

impl IntakeLoop {
    pub fn new(
        stream: Arc<dyn EventStream>,
        pipeline: EventPipeline,
        settings: IntakeSettings,
    ) -> Self {
        Self {
            stream,
            pipeline,
            settings,
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Runs until a stop is requested through `stop` or the stream fails for good.
    ///
    /// The stop flag is only checked between batches: a batch that was received is always
    /// processed and checkpointed before returning.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> Result<(), StreamError> {
        info!(
            max_batch_size = self.settings.max_batch_size,
            max_wait_ms = self.settings.max_wait.as_millis() as u64,
            "Starting event intake loop"
        );
        metrics::gauge!(PROCESSOR_RUNNING).set(1.0);

        let result = self.receive_until_stopped(stop).await;

        metrics::gauge!(PROCESSOR_RUNNING).set(0.0);
        if let Some(liveness) = &self.liveness {
            let status = match &result {
                Ok(()) => ComponentStatus::Idle,
                Err(_) => ComponentStatus::Unhealthy,
            };
            liveness.report_status(status).await;
        }

        match &result {
            Ok(()) => info!("Event intake loop stopped"),
            Err(e) => error!(error = %e, "Event intake loop failed"),
        }
        result
    }

    async fn receive_until_stopped(&self, stop: watch::Receiver<bool>) -> Result<(), StreamError> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            if let Some(liveness) = &self.liveness {
                liveness.report_healthy().await;
            }

            let batch = match self
                .stream
                .receive_batch(self.settings.max_batch_size, self.settings.max_wait)
                .await
            {
                Ok(batch) => batch,
                Err(StreamError::Closed) => {
                    info!("Event stream closed");
                    return Ok(());
                }
                Err(e) => {
                    metrics::counter!(EVENT_PROCESSING_ERRORS, "error_type" => ERROR_CONSUMER)
                        .increment(1);
                    return Err(e);
                }
            };

            self.process_batch(batch).await;
        }
    }

    /// Processes every partition group of the batch concurrently, each in delivery order.
    pub async fn process_batch(&self, batch: ReceivedBatch) -> Vec<PartitionReport> {
        for partition_error in &batch.errors {
            error!(
                partition = ?partition_error.partition,
                error = %partition_error.error,
                "Error receiving events from partition"
            );
            metrics::counter!(EVENT_PROCESSING_ERRORS, "error_type" => ERROR_PARTITION)
                .increment(1);
        }

        if batch.records.is_empty() {
            return vec![];
        }

        metrics::histogram!(BATCH_SIZE).record(batch.records.len() as f64);
        debug!(records = batch.records.len(), "Received batch");

        let groups = group_by_partition(batch.records);
        let mut reports = join_all(
            groups
                .into_iter()
                .map(|(partition, records)| self.process_partition(partition, records)),
        )
        .await;
        reports.sort_by_key(|report| report.partition);
        reports
    }

    async fn process_partition(&self, partition: i32, records: Vec<RawEvent>) -> PartitionReport {
        let mut report = PartitionReport {
            partition,
            processed: 0,
            failed: 0,
            checkpointed: false,
        };

        for record in &records {
            if self.pipeline.process(record).await.is_processed() {
                report.processed += 1;
            } else {
                report.failed += 1;
            }
        }

        // Every event reached a terminal outcome, the partition can move past them
        let Some(last) = records.last() else {
            return report;
        };
        let cursor = PartitionCursor {
            topic: last.topic.clone(),
            partition,
            offset: last.offset,
        };

        match self.stream.update_checkpoint(&cursor).await {
            Ok(()) => {
                metrics::counter!(CHECKPOINTS, "status" => "ok").increment(1);
                report.checkpointed = true;
            }
            Err(e) => {
                warn!(partition, offset = cursor.offset, error = %e, "Failed to update checkpoint");
                metrics::counter!(CHECKPOINTS, "status" => "error").increment(1);
                metrics::counter!(EVENT_PROCESSING_ERRORS, "error_type" => ERROR_CHECKPOINT)
                    .increment(1);
            }
        }

        report
    }
}

/// Splits records per partition, keeping arrival order inside each partition.
fn group_by_partition(records: Vec<RawEvent>) -> HashMap<i32, Vec<RawEvent>> {
    let mut groups: HashMap<i32, Vec<RawEvent>> = HashMap::new();
    for record in records {
        groups.entry(record.partition).or_default().push(record);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, WorkTimings};
    use crate::fault::FaultInjector;
    use crate::notify::RecordingNotifier;
    use crate::store::{IdempotentStore, MemoryDocumentStore};
    use crate::stream::memory::{json_record, raw_record};
    use crate::stream::MemoryEventStream;
    use serde_json::json;

    fn intake(stream: Arc<MemoryEventStream>, documents: Arc<MemoryDocumentStore>) -> IntakeLoop {
        let pipeline = EventPipeline::new(
            FaultInjector::disabled(),
            Arc::new(Dispatcher::new(
                Arc::new(RecordingNotifier::new()),
                WorkTimings::instant(),
            )),
            Some(IdempotentStore::new(documents, FaultInjector::disabled())),
            None,
        );
        IntakeLoop::new(
            stream,
            pipeline,
            IntakeSettings {
                max_batch_size: 10,
                max_wait: Duration::from_millis(10),
            },
        )
    }

    #[test]
    fn test_grouping_keeps_arrival_order() {
        let records = vec![
            json_record(1, 10, "A", json!({})),
            json_record(0, 5, "A", json!({})),
            json_record(1, 11, "A", json!({})),
            json_record(0, 6, "A", json!({})),
        ];

        let groups = group_by_partition(records);

        let offsets = |p: i32| groups[&p].iter().map(|r| r.offset).collect::<Vec<_>>();
        assert_eq!(offsets(0), vec![5, 6]);
        assert_eq!(offsets(1), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_each_partition_checkpointed_once_at_last_offset() {
        let stream = Arc::new(MemoryEventStream::new());
        let documents = Arc::new(MemoryDocumentStore::new());
        let intake = intake(stream.clone(), documents.clone());

        let reports = intake
            .process_batch(ReceivedBatch {
                records: vec![
                    json_record(0, 0, "OrderCreated", json!({"OrderId": "O1"})),
                    json_record(1, 7, "OrderCreated", json!({"OrderId": "O2"})),
                    json_record(0, 1, "OrderCreated", json!({"OrderId": "O3"})),
                ],
                errors: vec![],
            })
            .await;

        assert_eq!(
            reports,
            vec![
                PartitionReport {
                    partition: 0,
                    processed: 2,
                    failed: 0,
                    checkpointed: true
                },
                PartitionReport {
                    partition: 1,
                    processed: 1,
                    failed: 0,
                    checkpointed: true
                },
            ]
        );
        assert_eq!(stream.checkpoints().len(), 2);
        assert_eq!(stream.committed_offsets(), HashMap::from([(0, 1), (1, 7)]));
        assert_eq!(documents.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_events_still_advance_the_checkpoint() {
        let stream = Arc::new(MemoryEventStream::new());
        let documents = Arc::new(MemoryDocumentStore::new());
        let intake = intake(stream.clone(), documents.clone());

        let reports = intake
            .process_batch(ReceivedBatch {
                records: vec![
                    raw_record(0, 0, "OrderCreated", b"not json"),
                    json_record(0, 1, "OrderCreated", json!({"OrderId": "O1"})),
                ],
                errors: vec![],
            })
            .await;

        assert_eq!(reports[0].processed, 1);
        assert_eq!(reports[0].failed, 1);
        assert_eq!(stream.committed_offsets(), HashMap::from([(0, 1)]));
        assert!(documents.get("OrderCreated_O1").is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_failure_does_not_stop_the_loop() {
        let stream = Arc::new(MemoryEventStream::new());
        stream.fail_checkpoints(true);
        stream.push_batch(vec![json_record(0, 0, "OrderCreated", json!({"OrderId": "O1"}))]);
        stream.push_batch(vec![json_record(0, 1, "OrderCreated", json!({"OrderId": "O2"}))]);
        stream.close_when_drained();
        let documents = Arc::new(MemoryDocumentStore::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        intake(stream.clone(), documents.clone())
            .run(stop_rx)
            .await
            .unwrap();

        assert_eq!(documents.len(), 2);
        assert!(stream.checkpoints().is_empty());
    }

    #[tokio::test]
    async fn test_partition_errors_are_not_fatal() {
        let stream = Arc::new(MemoryEventStream::new());
        stream.push_error(Some(3), "leader not available");
        stream.push_batch(vec![json_record(0, 0, "OrderCreated", json!({"OrderId": "O1"}))]);
        stream.close_when_drained();
        let documents = Arc::new(MemoryDocumentStore::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        intake(stream.clone(), documents.clone())
            .run(stop_rx)
            .await
            .unwrap();

        assert_eq!(documents.len(), 1);
        assert_eq!(stream.committed_offsets(), HashMap::from([(0, 0)]));
    }

    #[tokio::test]
    async fn test_stop_is_checked_before_receiving() {
        let stream = Arc::new(MemoryEventStream::new());
        stream.push_batch(vec![json_record(0, 0, "OrderCreated", json!({"OrderId": "O1"}))]);
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        intake(stream.clone(), Arc::new(MemoryDocumentStore::new()))
            .run(stop_rx)
            .await
            .unwrap();

        assert_eq!(stream.receive_calls(), 0);
        assert_eq!(stream.pending(), 1);
    }
}
