use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::stream::{
    EventStream, PartitionCursor, PartitionError, RawEvent, ReceivedBatch, StreamError,
};

/// Kafka-backed event stream. Offsets are never stored or committed automatically,
/// only through [`EventStream::update_checkpoint`].
pub struct KafkaEventStream {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaEventStream {
    pub fn new(config: &Config) -> Result<Self, StreamError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("statistics.interval.ms", "10000")
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.partition.eof", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_topic.as_str()])?;

        info!(
            topic = config.kafka_topic,
            group_id = config.kafka_consumer_group,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: config.kafka_topic.clone(),
        })
    }

    /// Returns the error back only when it is fatal for the whole consumer.
    /// Transient errors are slept on with a backoff growing with `attempt`.
    async fn handle_kafka_error(e: KafkaError, attempt: u64) -> Option<KafkaError> {
        match &e {
            KafkaError::PartitionEOF(partition) => {
                debug!(partition, "Reached end of partition");
                None
            }
            KafkaError::MessageConsumption(code) => {
                match code {
                    RDKafkaErrorCode::OperationTimedOut => {}
                    RDKafkaErrorCode::OffsetOutOfRange => {
                        // "auto.offset.reset" will trigger a seek to head or tail
                        warn!("Offset out of range - seeking to configured offset reset policy");
                        sleep(Duration::from_millis(500)).await;
                    }
                    _ => {
                        warn!("Kafka consumer error: {code:?}");
                        sleep(Duration::from_millis(100 * attempt.min(10))).await;
                    }
                }
                None
            }
            KafkaError::MessageConsumptionFatal(code) => {
                error!("Fatal Kafka consumer error: {code:?}");
                Some(e)
            }
            KafkaError::Global(code) => match code {
                RDKafkaErrorCode::Authentication => {
                    error!("Authentication failed: {code:?}");
                    Some(e)
                }
                RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure => {
                    warn!("Broker connectivity lost: {code:?} - waiting for reconnect");
                    sleep(Duration::from_secs(attempt.min(5))).await;
                    None
                }
                _ => {
                    warn!("Global Kafka error: {code:?}");
                    sleep(Duration::from_millis(500 * attempt.min(6))).await;
                    None
                }
            },
            KafkaError::Canceled => {
                info!("Consumer canceled");
                Some(e)
            }
            _ => {
                error!("Unexpected Kafka error: {e:?}");
                sleep(Duration::from_millis(100 * attempt.min(10))).await;
                None
            }
        }
    }
}

/// Whether an error surfaced by [`KafkaEventStream::handle_kafka_error`] should be reported
/// as a partition error on the batch. End-of-partition and poll timeouts are routine.
fn is_reportable(e: &KafkaError) -> bool {
    !matches!(
        e,
        KafkaError::PartitionEOF(_)
            | KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut)
    )
}

fn raw_event_from_message(msg: &BorrowedMessage<'_>) -> RawEvent {
    let headers = msg
        .headers()
        .map(|hdrs| {
            hdrs.iter()
                .filter_map(|header| {
                    header
                        .value
                        .map(|v| (header.key.to_string(), String::from_utf8_lossy(v).into_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    RawEvent {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        timestamp_ms: msg.timestamp().to_millis(),
        headers,
        payload: msg.payload().map(<[u8]>::to_vec),
    }
}

#[async_trait]
impl EventStream for KafkaEventStream {
    async fn receive_batch(
        &self,
        max_batch_size: usize,
        max_wait: Duration,
    ) -> Result<ReceivedBatch, StreamError> {
        let deadline = Instant::now() + max_wait;
        let mut batch = ReceivedBatch {
            records: Vec::with_capacity(max_batch_size),
            errors: vec![],
        };
        let mut kafka_error_count = 0;

        while batch.records.len() < max_batch_size {
            match timeout_at(deadline, self.consumer.recv()).await {
                // Deadline reached - return what we have
                Err(_) => break,
                Ok(Ok(message)) => {
                    batch.records.push(raw_event_from_message(&message));
                    kafka_error_count = 0;
                }
                Ok(Err(e)) => {
                    kafka_error_count += 1;
                    let reportable = is_reportable(&e);
                    let description = format!("{} consumer error: {e}", self.topic);
                    if let Some(fatal) = Self::handle_kafka_error(e, kafka_error_count).await {
                        return Err(fatal.into());
                    }
                    if reportable {
                        // librdkafka does not attribute consumption errors to a partition
                        batch.errors.push(PartitionError {
                            partition: None,
                            error: StreamError::Other(description),
                        });
                    }
                }
            }
        }

        Ok(batch)
    }

    async fn update_checkpoint(&self, cursor: &PartitionCursor) -> Result<(), StreamError> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            &cursor.topic,
            cursor.partition,
            Offset::Offset(cursor.next_offset()),
        )?;

        self.consumer.commit(&list, CommitMode::Async)?;
        Ok(())
    }
}
