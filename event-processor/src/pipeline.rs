//! Per-event processing: decode, fault guard, dispatch, then the best-effort side effects.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info_span, Instrument};

use crate::cache::RecentActivityCache;
use crate::dispatch::{Dispatcher, ProcessingError};
use crate::event::Event;
use crate::fault::FaultInjector;
use crate::metrics_consts::{
    ERROR_CACHE, ERROR_MALFORMED_PAYLOAD, ERROR_PROCESSING, ERROR_STORE,
    EVENTS_PROCESSED, EVENT_PROCESSING_DURATION, EVENT_PROCESSING_ERRORS,
};
use crate::store::{IdempotentStore, PersistOutcome};
use crate::stream::RawEvent;

pub const PROCESS_OPERATION: &str = "process_event";

#[derive(Debug)]
pub struct ProcessedEvent {
    pub event_type: String,
    pub handler: &'static str,
    pub notified: bool,
    /// `None` when no store is configured
    pub persisted: Option<PersistOutcome>,
    /// `None` when no cache is configured, otherwise whether the summary was written
    pub cached: Option<bool>,
}

/// Both variants are terminal: a failed event is not retried by the pipeline.
#[derive(Debug)]
pub enum EventOutcome {
    Processed(ProcessedEvent),
    Failed(ProcessingError),
}

impl EventOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, EventOutcome::Processed(_))
    }
}

#[derive(Clone)]
pub struct EventPipeline {
    injector: FaultInjector,
    dispatcher: Arc<Dispatcher>,
    store: Option<IdempotentStore>,
    cache: Option<RecentActivityCache>,
}

impl EventPipeline {
    pub fn new(
        injector: FaultInjector,
        dispatcher: Arc<Dispatcher>,
        store: Option<IdempotentStore>,
        cache: Option<RecentActivityCache>,
    ) -> Self {
        Self {
            injector,
            dispatcher,
            store,
            cache,
        }
    }

    pub fn cache(&self) -> Option<&RecentActivityCache> {
        self.cache.as_ref()
    }

    pub async fn process(&self, raw: &RawEvent) -> EventOutcome {
        let span = info_span!(
            "process_event",
            event.id = tracing::field::Empty,
            event.type = tracing::field::Empty,
            event.source = tracing::field::Empty,
            event.partition = raw.partition,
            event.offset = raw.offset,
            otel.status_code = tracing::field::Empty,
        );

        let outcome = self.process_inner(raw).instrument(span.clone()).await;

        if let EventOutcome::Failed(e) = &outcome {
            span.record("otel.status_code", "ERROR");
            let error_type = match e {
                ProcessingError::Decode(_) => ERROR_MALFORMED_PAYLOAD,
                _ => ERROR_PROCESSING,
            };
            metrics::counter!(EVENT_PROCESSING_ERRORS, "error_type" => error_type).increment(1);
            span.in_scope(|| {
                error!(
                    partition = raw.partition,
                    offset = raw.offset,
                    error = %e,
                    error_type,
                    "Error processing event"
                )
            });
        }

        outcome
    }

    async fn process_inner(&self, raw: &RawEvent) -> EventOutcome {
        let start = Instant::now();

        let event = match Event::decode(raw) {
            Ok(event) => event,
            Err(e) => return EventOutcome::Failed(e.into()),
        };

        let span = tracing::Span::current();
        span.record("event.id", event.id.as_str());
        span.record("event.type", event.event_type());
        span.record("event.source", event.source.as_str());

        if let Err(fault) = self.injector.maybe_inject_failure(PROCESS_OPERATION).await {
            return EventOutcome::Failed(fault.into());
        }

        let handled = match self.dispatcher.dispatch(&event).await {
            Ok(handled) => handled,
            Err(e) => return EventOutcome::Failed(e),
        };

        let persisted = match &self.store {
            Some(store) => {
                let outcome = store.persist(&event).await;
                if matches!(outcome, PersistOutcome::Failed { .. }) {
                    metrics::counter!(EVENT_PROCESSING_ERRORS, "error_type" => ERROR_STORE)
                        .increment(1);
                }
                Some(outcome)
            }
            None => None,
        };

        let cached = match &self.cache {
            Some(cache) => {
                let written = cache
                    .record_summary(event.event_type(), &event.body)
                    .await
                    .is_ok();
                if !written {
                    metrics::counter!(EVENT_PROCESSING_ERRORS, "error_type" => ERROR_CACHE)
                        .increment(1);
                }
                Some(written)
            }
            None => None,
        };

        metrics::counter!(
            EVENTS_PROCESSED,
            "event_type" => event.event_type().to_string(),
            "source" => event.source.clone()
        )
        .increment(1);
        metrics::histogram!(
            EVENT_PROCESSING_DURATION,
            "event_type" => event.event_type().to_string()
        )
        .record(start.elapsed().as_secs_f64());

        EventOutcome::Processed(ProcessedEvent {
            event_type: event.event_type().to_string(),
            handler: handled.handler,
            notified: handled.notified,
            persisted,
            cached,
        })
    }
}
