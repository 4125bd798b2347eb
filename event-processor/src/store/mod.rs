//! Idempotent persistence of processed events.
//!
//! Every processed event is written as a [`ProcessedEventDocument`] whose id only depends
//! on the event content, so a redelivered event overwrites its own earlier record instead
//! of creating a new one. Partitions race freely on the same id; the backend either
//! resolves the race itself (upsert) or reports a conflict, which is treated as success.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::event::Event;
use crate::fault::{FaultInjector, InjectedFault};
use crate::metrics_consts::STORE_WRITES;
use crate::SERVICE_NAME;

pub mod memory;
pub mod postgres;

pub use memory::MemoryDocumentStore;
pub use postgres::PostgresDocumentStore;

pub const STORE_OPERATION: &str = "store_processed_event";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("write conflict on document {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid collection name '{0}'")]
    InvalidCollection(String),
    #[error(transparent)]
    Injected(#[from] InjectedFault),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEventDocument {
    pub id: String,
    pub event_type: String,
    pub event_data: Map<String, Value>,
    pub processed_at: DateTime<Utc>,
    pub processing_service: String,
}

impl ProcessedEventDocument {
    pub fn from_event(event: &Event) -> Self {
        Self {
            id: document_id(event),
            event_type: event.event_type().to_string(),
            event_data: event.body.clone(),
            processed_at: Utc::now(),
            processing_service: SERVICE_NAME.to_string(),
        }
    }
}

/// `{eventType}_{businessEntityId}`. Events without a business id are keyed by a digest of
/// their payload, so redelivering them stays idempotent too.
pub fn document_id(event: &Event) -> String {
    match event.business_entity_id() {
        Some(entity_id) => format!("{}_{}", event.event_type(), entity_id),
        None => format!("{}_payload-{}", event.event_type(), payload_digest(&event.body)),
    }
}

fn payload_digest(body: &Map<String, Value>) -> String {
    let canonical = Value::Object(body.clone()).to_string();
    let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
    digest[..16].to_string()
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or overwrite the document with the same id. A backend that detects a
    /// concurrent writer on the same id returns [`StoreError::Conflict`].
    async fn upsert(&self, document: &ProcessedEventDocument) -> Result<(), StoreError>;
}

#[derive(Debug)]
pub enum PersistOutcome {
    Stored(String),
    /// Another writer got there first, the event has already been processed
    Duplicate(String),
    Failed {
        document_id: String,
        error: StoreError,
    },
}

impl PersistOutcome {
    pub fn document_id(&self) -> &str {
        match self {
            PersistOutcome::Stored(id) | PersistOutcome::Duplicate(id) => id,
            PersistOutcome::Failed { document_id, .. } => document_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PersistOutcome::Stored(_) => "stored",
            PersistOutcome::Duplicate(_) => "duplicate",
            PersistOutcome::Failed { .. } => "failed",
        }
    }
}

/// Best-effort, conflict-tolerant writer in front of a [`DocumentStore`].
#[derive(Clone)]
pub struct IdempotentStore {
    backend: Arc<dyn DocumentStore>,
    injector: FaultInjector,
}

impl IdempotentStore {
    pub fn new(backend: Arc<dyn DocumentStore>, injector: FaultInjector) -> Self {
        Self { backend, injector }
    }

    /// Never fails: conflicts become [`PersistOutcome::Duplicate`] and every other error is
    /// logged and handed back as [`PersistOutcome::Failed`] for the caller to count.
    pub async fn persist(&self, event: &Event) -> PersistOutcome {
        let document = ProcessedEventDocument::from_event(event);
        let span = info_span!(
            "store_processed_event",
            store.document_id = %document.id,
            store.duplicate_event = tracing::field::Empty,
            otel.status_code = tracing::field::Empty,
        );

        let outcome = async {
            let result = match self.injector.maybe_inject_failure(STORE_OPERATION).await {
                Ok(()) => self.backend.upsert(&document).await,
                Err(fault) => Err(fault.into()),
            };

            match result {
                Ok(()) => {
                    info!(
                        document_id = %document.id,
                        event_type = %document.event_type,
                        "Event stored"
                    );
                    PersistOutcome::Stored(document.id)
                }
                Err(StoreError::Conflict(_)) => {
                    tracing::Span::current().record("store.duplicate_event", true);
                    warn!(
                        document_id = %document.id,
                        event_type = %document.event_type,
                        "Duplicate event already processed (concurrent partition)"
                    );
                    PersistOutcome::Duplicate(document.id)
                }
                Err(error) => {
                    tracing::Span::current().record("otel.status_code", "ERROR");
                    error!(
                        document_id = %document.id,
                        event_type = %document.event_type,
                        error = %error,
                        "Failed to store event"
                    );
                    PersistOutcome::Failed {
                        document_id: document.id,
                        error,
                    }
                }
            }
        }
        .instrument(span)
        .await;

        metrics::counter!(STORE_WRITES, "outcome" => outcome.label()).increment(1);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FailureInjectionPolicy;
    use crate::stream::memory::json_record;
    use serde_json::json;

    fn event(event_type: &str, body: Value) -> Event {
        Event::decode(&json_record(0, 0, event_type, body)).unwrap()
    }

    #[test]
    fn test_document_id_uses_business_id() {
        let created = event("OrderCreated", json!({"OrderId": "O1", "CustomerId": "C1"}));
        assert_eq!(document_id(&created), "OrderCreated_O1");

        let updated = event("OrderStatusUpdated", json!({"orderId": 7, "status": "shipped"}));
        assert_eq!(document_id(&updated), "OrderStatusUpdated_7");
    }

    #[test]
    fn test_document_id_without_business_id_is_deterministic() {
        let first = event("Unknown", json!({"foo": 1, "bar": 2}));
        let redelivered = event("Unknown", json!({"foo": 1, "bar": 2}));
        let other = event("Unknown", json!({"foo": 1, "bar": 3}));

        let id = document_id(&first);
        assert!(id.starts_with("Unknown_payload-"));
        assert_eq!(id.len(), "Unknown_payload-".len() + 16);
        assert_eq!(id, document_id(&redelivered));
        assert_ne!(id, document_id(&other));
    }

    #[test]
    fn test_document_serialization() {
        let event = event("OrderCreated", json!({"OrderId": "O1"}));
        let document = ProcessedEventDocument::from_event(&event);
        let value = serde_json::to_value(&document).unwrap();

        assert_eq!(value["id"], "OrderCreated_O1");
        assert_eq!(value["eventType"], "OrderCreated");
        assert_eq!(value["eventData"], json!({"OrderId": "O1"}));
        assert_eq!(value["processingService"], SERVICE_NAME);
        assert!(value["processedAt"].is_string());
    }

    #[tokio::test]
    async fn test_redelivery_keeps_one_document() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let store = IdempotentStore::new(backend.clone(), FaultInjector::disabled());
        let event = event("OrderCreated", json!({"OrderId": "O1", "CustomerId": "C1"}));

        for _ in 0..3 {
            assert!(matches!(
                store.persist(&event).await,
                PersistOutcome::Stored(_)
            ));
        }

        assert_eq!(backend.len(), 1);
        assert_eq!(backend.upserts(), 3);
        assert!(backend.get("OrderCreated_O1").is_some());
    }

    #[tokio::test]
    async fn test_conflict_is_a_duplicate() {
        let backend = Arc::new(MemoryDocumentStore::new());
        backend.conflict_once("OrderCreated_O1");
        let store = IdempotentStore::new(backend.clone(), FaultInjector::disabled());

        let outcome = store
            .persist(&event("OrderCreated", json!({"OrderId": "O1"})))
            .await;

        assert!(matches!(outcome, PersistOutcome::Duplicate(ref id) if id == "OrderCreated_O1"));
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported_not_raised() {
        let backend = Arc::new(MemoryDocumentStore::new());
        backend.fail_once("OrderCreated_O1", "connection reset");
        let store = IdempotentStore::new(backend.clone(), FaultInjector::disabled());

        let outcome = store
            .persist(&event("OrderCreated", json!({"OrderId": "O1"})))
            .await;

        match outcome {
            PersistOutcome::Failed { document_id, error } => {
                assert_eq!(document_id, "OrderCreated_O1");
                assert!(matches!(error, StoreError::Unavailable(_)));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_injected_database_fault_skips_write() {
        let backend = Arc::new(MemoryDocumentStore::new());
        let injector = FaultInjector::new(FailureInjectionPolicy {
            enabled: true,
            latency_probability: 0.0,
            error_probability: 1.0,
        });
        let store = IdempotentStore::new(backend.clone(), injector);

        let outcome = store
            .persist(&event("OrderCreated", json!({"OrderId": "O1"})))
            .await;

        assert!(matches!(
            outcome,
            PersistOutcome::Failed {
                error: StoreError::Injected(_),
                ..
            }
        ));
        assert_eq!(backend.upserts(), 0);
    }
}
