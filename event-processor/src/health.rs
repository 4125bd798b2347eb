use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Liveness reporting for the long running loops of the processor.
///
/// Each loop registers a component with a deadline and must keep reporting before it
/// expires. The process is live when every component is either recently healthy or
/// deliberately idle. A component that misses its deadline is reported as stalled.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first report
    Starting,
    HealthyUntil(time::OffsetDateTime),
    /// Stopped on purpose, e.g. processing was paused through the control API
    Idle,
    Unhealthy,
    /// The HealthyUntil deadline passed without a new report
    Stalled,
}

impl ComponentStatus {
    pub fn is_live(&self, now: time::OffsetDateTime) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&now),
            ComponentStatus::Idle => true,
            _ => false,
        }
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Must be called more frequently than the registered deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Must be called from within a tokio runtime.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    warn!("poisoned HealthRegistry lock")
                }
            }
        });

        registry
    }

    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_string(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall status, unhealthy until at least one component registered.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = time::OffsetDateTime::now_utc();

        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, status) in components.iter() {
            let reported = match status {
                ComponentStatus::HealthyUntil(until) if until.le(&now) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !reported.is_live(now) {
                result.healthy = false;
            }
            _ = result.components.insert(name.clone(), reported);
        }

        match result.healthy {
            true => debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
