use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::fault::{FailureInjectionPolicy, FaultInjector};
use crate::intake::IntakeLoop;

#[derive(Error, Debug, PartialEq)]
pub enum SupervisorError {
    #[error("processing is already running")]
    AlreadyRunning,
    #[error(transparent)]
    InvalidPolicy(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FailureInjectionState {
    #[serde(flatten)]
    pub policy: FailureInjectionPolicy,
    pub last_updated: DateTime<Utc>,
}

struct RunningTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// Owns the single background intake task and the shared failure injection policy.
///
/// `start` and `stop` serialize on the task slot, and `stop` keeps it locked until the
/// task has terminated, so at most one intake loop exists at any time.
pub struct ProcessingSupervisor {
    intake: IntakeLoop,
    injector: FaultInjector,
    shutdown_timeout: Duration,
    running: Arc<AtomicBool>,
    task: Mutex<Option<RunningTask>>,
    policy_updated_at: RwLock<DateTime<Utc>>,
}

impl ProcessingSupervisor {
    pub fn new(intake: IntakeLoop, injector: FaultInjector, shutdown_timeout: Duration) -> Self {
        Self {
            intake,
            injector,
            shutdown_timeout,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            policy_updated_at: RwLock::new(Utc::now()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the intake loop, unless one is already running.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut task = self.task.lock().await;
        if self.is_running() {
            return Err(SupervisorError::AlreadyRunning);
        }

        // A previous loop may have ended on its own, its handle is finished
        self.running.store(true, Ordering::SeqCst);
        let (stop, stop_rx) = watch::channel(false);
        let intake = self.intake.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = intake.run(stop_rx).await {
                warn!(error = %e, "Event processing ended without a stop request");
            }
            running.store(false, Ordering::SeqCst);
        });

        *task = Some(RunningTask { handle, stop });
        info!("Event processing started");
        Ok(())
    }

    /// Asks the loop to stop after its current batch and waits for it, at most for the
    /// shutdown timeout. Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let mut task = self.task.lock().await;
        if !self.is_running() {
            // The loop already ended on its own
            *task = None;
            return false;
        }
        let Some(RunningTask { mut handle, stop }) = task.take() else {
            return false;
        };

        _ = stop.send(true);
        match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Event processing task ended abnormally"),
            Err(_) => {
                warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Event processing did not stop in time, aborting"
                );
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Event processing task ended abnormally");
                    }
                }
            }
        }

        // The task is gone and the slot is still locked, no other loop can exist
        self.running.store(false, Ordering::SeqCst);
        info!("Event processing stopped");
        true
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            running: self.is_running(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure_injection(&self) -> FailureInjectionState {
        let last_updated = match self.policy_updated_at.read() {
            Ok(at) => *at,
            Err(poisoned) => *poisoned.into_inner(),
        };
        FailureInjectionState {
            policy: self.injector.policy(),
            last_updated,
        }
    }

    /// Replaces the whole policy. Invalid probabilities leave the current policy untouched.
    pub fn set_failure_injection(
        &self,
        policy: FailureInjectionPolicy,
    ) -> Result<FailureInjectionState, SupervisorError> {
        self.injector.set_policy(policy)?;
        let now = Utc::now();
        match self.policy_updated_at.write() {
            Ok(mut at) => *at = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
        info!(
            enabled = policy.enabled,
            latency_probability = policy.latency_probability,
            error_probability = policy.error_probability,
            "Failure injection updated"
        );
        Ok(FailureInjectionState {
            policy,
            last_updated: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::dispatch::{Dispatcher, WorkRange, WorkTimings};
    use crate::intake::IntakeSettings;
    use crate::notify::RecordingNotifier;
    use crate::pipeline::EventPipeline;
    use crate::store::{IdempotentStore, MemoryDocumentStore};
    use crate::stream::memory::json_record;
    use crate::stream::MemoryEventStream;
    use serde_json::json;

    fn supervisor(stream: Arc<MemoryEventStream>) -> ProcessingSupervisor {
        let injector = FaultInjector::disabled();
        let pipeline = EventPipeline::new(
            injector.clone(),
            Arc::new(Dispatcher::new(
                Arc::new(RecordingNotifier::new()),
                WorkTimings::instant(),
            )),
            None,
            None,
        );
        let intake = IntakeLoop::new(
            stream,
            pipeline,
            IntakeSettings {
                max_batch_size: 10,
                max_wait: Duration::from_millis(10),
            },
        );
        ProcessingSupervisor::new(intake, injector, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let supervisor = supervisor(Arc::new(MemoryEventStream::new()));

        supervisor.start().await.unwrap();
        assert_eq!(supervisor.start().await, Err(SupervisorError::AlreadyRunning));
        assert!(supervisor.status().running);

        assert!(supervisor.stop().await);
        assert!(!supervisor.status().running);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_a_noop() {
        let supervisor = supervisor(Arc::new(MemoryEventStream::new()));

        assert!(!supervisor.stop().await);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let stream = Arc::new(MemoryEventStream::new());
        let supervisor = supervisor(stream.clone());

        supervisor.start().await.unwrap();
        assert!(supervisor.stop().await);
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());

        stream.push_batch(vec![json_record(0, 4, "OrderCreated", json!({"OrderId": "O1"}))]);
        for _ in 0..100 {
            if !stream.checkpoints().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stream.committed_offsets().get(&0), Some(&4));

        assert!(supervisor.stop().await);
    }

    #[tokio::test]
    async fn test_running_clears_when_loop_ends_on_its_own() {
        let stream = Arc::new(MemoryEventStream::new());
        stream.close_when_drained();
        let supervisor = supervisor(stream);

        supervisor.start().await.unwrap();
        for _ in 0..100 {
            if !supervisor.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!supervisor.is_running());
        assert!(!supervisor.stop().await);
        supervisor.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_injection_is_replaced_as_a_whole() {
        let supervisor = supervisor(Arc::new(MemoryEventStream::new()));
        let before = supervisor.failure_injection().last_updated;

        let policy = FailureInjectionPolicy {
            enabled: true,
            latency_probability: 0.5,
            error_probability: 0.25,
        };
        let state = supervisor.set_failure_injection(policy).unwrap();

        assert_eq!(state.policy, policy);
        assert!(state.last_updated >= before);
        assert_eq!(supervisor.failure_injection().policy, policy);

        let invalid = FailureInjectionPolicy {
            error_probability: 2.0,
            ..policy
        };
        assert!(matches!(
            supervisor.set_failure_injection(invalid),
            Err(SupervisorError::InvalidPolicy(_))
        ));
        assert_eq!(supervisor.failure_injection().policy, policy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_during_stop_keeps_a_single_loop() {
        let supervisor = Arc::new(supervisor(Arc::new(MemoryEventStream::new())));

        for _ in 0..50 {
            supervisor.start().await.unwrap();

            let stop_returned = Arc::new(AtomicBool::new(false));
            let starter = tokio::spawn({
                let supervisor = supervisor.clone();
                let stop_returned = stop_returned.clone();
                async move {
                    loop {
                        if supervisor.start().await.is_ok() {
                            return true;
                        }
                        if stop_returned.load(Ordering::SeqCst) {
                            return false;
                        }
                        tokio::task::yield_now().await;
                    }
                }
            });

            assert!(supervisor.stop().await);
            stop_returned.store(true, Ordering::SeqCst);
            let started = starter.await.unwrap();

            assert_eq!(supervisor.is_running(), started);
            if started {
                assert_eq!(
                    supervisor.start().await,
                    Err(SupervisorError::AlreadyRunning)
                );
                assert!(supervisor.stop().await);
            }
            assert!(!supervisor.is_running());
        }
    }

    #[tokio::test]
    async fn test_stop_waits_for_the_batch_in_flight() {
        let stream = Arc::new(MemoryEventStream::new());
        let documents = Arc::new(MemoryDocumentStore::new());
        let injector = FaultInjector::disabled();
        let timings = WorkTimings {
            order_created: WorkRange::millis(30, 30),
            ..WorkTimings::instant()
        };
        let pipeline = EventPipeline::new(
            injector.clone(),
            Arc::new(Dispatcher::new(Arc::new(RecordingNotifier::new()), timings)),
            Some(IdempotentStore::new(documents.clone(), injector.clone())),
            None,
        );
        let intake = IntakeLoop::new(
            stream.clone(),
            pipeline,
            IntakeSettings {
                max_batch_size: 10,
                max_wait: Duration::from_millis(10),
            },
        );
        let supervisor = ProcessingSupervisor::new(intake, injector, Duration::from_secs(5));

        stream.push_batch(
            (0..5)
                .map(|i| json_record(0, i, "OrderCreated", json!({"OrderId": format!("O{i}")})))
                .collect(),
        );
        supervisor.start().await.unwrap();
        for _ in 0..100 {
            if stream.receive_calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(stream.checkpoints().is_empty());

        assert!(supervisor.stop().await);

        assert_eq!(documents.len(), 5);
        assert_eq!(stream.committed_offsets(), HashMap::from([(0, 4)]));
        assert_eq!(stream.pending(), 0);
    }
}
