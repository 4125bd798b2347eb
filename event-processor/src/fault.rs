use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::config::ConfigError;
use crate::metrics_consts::FAILURE_INJECTIONS;

/// Injected latency is drawn uniformly from this range.
pub const MIN_INJECTED_LATENCY: Duration = Duration::from_millis(100);
pub const MAX_INJECTED_LATENCY: Duration = Duration::from_millis(2000);

/// Runtime-tunable failure injection settings. Always read and replaced as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailureInjectionPolicy {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_latency_probability")]
    pub latency_probability: f64,
    #[serde(default = "default_error_probability")]
    pub error_probability: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_latency_probability() -> f64 {
    0.1
}

fn default_error_probability() -> f64 {
    0.05
}

impl Default for FailureInjectionPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            latency_probability: default_latency_probability(),
            error_probability: default_error_probability(),
        }
    }
}

impl FailureInjectionPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_probability("latency_probability", self.latency_probability)?;
        check_probability("error_probability", self.error_probability)
    }
}

fn check_probability(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidProbability { name, value })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Network,
    Database,
    Processing,
    Timeout,
}

impl FaultKind {
    pub const ALL: [FaultKind; 4] = [
        FaultKind::Network,
        FaultKind::Database,
        FaultKind::Processing,
        FaultKind::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Network => "network",
            FaultKind::Database => "database",
            FaultKind::Processing => "processing",
            FaultKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Simulated {kind} error in {operation}")]
pub struct InjectedFault {
    pub kind: FaultKind,
    pub operation: String,
}

/// Draws from the shared policy to delay or fail the calling operation.
///
/// Cloning is cheap and every clone observes policy updates made through
/// [`FaultInjector::set_policy`].
#[derive(Clone, Debug)]
pub struct FaultInjector {
    policy: Arc<RwLock<FailureInjectionPolicy>>,
}

impl FaultInjector {
    pub fn new(policy: FailureInjectionPolicy) -> Self {
        Self {
            policy: Arc::new(RwLock::new(policy)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(FailureInjectionPolicy::disabled())
    }

    pub fn policy(&self) -> FailureInjectionPolicy {
        match self.policy.read() {
            Ok(policy) => *policy,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_policy(&self, policy: FailureInjectionPolicy) -> Result<(), ConfigError> {
        policy.validate()?;
        match self.policy.write() {
            Ok(mut current) => *current = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
        Ok(())
    }

    /// Possibly sleeps, then possibly fails, according to a single snapshot of the policy.
    pub async fn maybe_inject_failure(&self, operation: &str) -> Result<(), InjectedFault> {
        let policy = self.policy();
        if !policy.enabled {
            return Ok(());
        }

        // ThreadRng is not Send, draw everything before suspending
        let (delay, fault) = {
            let mut rng = rand::thread_rng();
            let delay = (rng.gen::<f64>() < policy.latency_probability)
                .then(|| rng.gen_range(MIN_INJECTED_LATENCY..=MAX_INJECTED_LATENCY));
            let fault = (rng.gen::<f64>() < policy.error_probability)
                .then(|| FaultKind::ALL[rng.gen_range(0..FaultKind::ALL.len())]);
            (delay, fault)
        };

        if let Some(delay) = delay {
            warn!(
                operation,
                delay_seconds = delay.as_secs_f64(),
                "Injecting latency"
            );
            metrics::counter!(FAILURE_INJECTIONS, "operation" => operation.to_string(), "kind" => "latency")
                .increment(1);
            tokio::time::sleep(delay).await;
        }

        if let Some(kind) = fault {
            error!(operation, error_type = %kind, "Injecting error");
            metrics::counter!(FAILURE_INJECTIONS, "operation" => operation.to_string(), "kind" => kind.as_str())
                .increment(1);
            return Err(InjectedFault {
                kind,
                operation: operation.to_string(),
            });
        }

        Ok(())
    }
}
