//! Shared harness for the end-to-end processing tests.
//!
//! Wires the real pipeline, intake loop and supervisor to the in-memory stream, store,
//! cache and notifier, so every scenario runs without external services.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use event_processor::cache::{MemoryListCache, RecentActivityCache};
use event_processor::dispatch::{Dispatcher, WorkTimings};
use event_processor::fault::{FailureInjectionPolicy, FaultInjector};
use event_processor::intake::{IntakeLoop, IntakeSettings};
use event_processor::notify::RecordingNotifier;
use event_processor::pipeline::EventPipeline;
use event_processor::store::{IdempotentStore, MemoryDocumentStore};
use event_processor::stream::MemoryEventStream;
use event_processor::supervisor::ProcessingSupervisor;
use tokio::sync::watch;

pub const MAX_BATCH_SIZE: usize = 10;

pub struct TestService {
    pub stream: Arc<MemoryEventStream>,
    pub documents: Arc<MemoryDocumentStore>,
    pub lists: Arc<MemoryListCache>,
    pub notifier: Arc<RecordingNotifier>,
    pub injector: FaultInjector,
    pub cache: RecentActivityCache,
    pub intake: IntakeLoop,
}

impl TestService {
    /// Failure injection disabled, instant simulated work
    pub fn new() -> Self {
        Self::with_policy(FailureInjectionPolicy::disabled())
    }

    pub fn with_policy(policy: FailureInjectionPolicy) -> Self {
        let stream = Arc::new(MemoryEventStream::new());
        let documents = Arc::new(MemoryDocumentStore::new());
        let lists = Arc::new(MemoryListCache::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let injector = FaultInjector::new(policy);

        let cache = RecentActivityCache::new(lists.clone(), injector.clone());
        let pipeline = EventPipeline::new(
            injector.clone(),
            Arc::new(Dispatcher::new(notifier.clone(), WorkTimings::instant())),
            Some(IdempotentStore::new(documents.clone(), injector.clone())),
            Some(cache.clone()),
        );
        let intake = IntakeLoop::new(
            stream.clone(),
            pipeline,
            IntakeSettings {
                max_batch_size: MAX_BATCH_SIZE,
                max_wait: Duration::from_millis(10),
            },
        );

        Self {
            stream,
            documents,
            lists,
            notifier,
            injector,
            cache,
            intake,
        }
    }

    /// Runs the intake loop until every queued delivery has been consumed.
    pub async fn run_until_drained(&self) {
        self.stream.close_when_drained();
        let (_stop_tx, stop_rx) = watch::channel(false);
        self.intake
            .run(stop_rx)
            .await
            .expect("intake loop failed");
    }

    pub fn supervisor(&self, shutdown_timeout: Duration) -> ProcessingSupervisor {
        ProcessingSupervisor::new(self.intake.clone(), self.injector.clone(), shutdown_timeout)
    }
}

/// Polls `check` every 10ms for up to 5s.
pub async fn wait_for<F>(check: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
