//! Customer notifications sent by order handlers.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const NOTIFICATIONS_PATH: &str = "/api/v1/notifications";

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification service responded with {0}")]
    Rejected(StatusCode),
    #[error("notification unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub channel: String,
    pub recipient: String,
    pub subject: String,
    pub message: String,
    pub customer_id: String,
    pub order_id: String,
    pub priority: String,
}

impl Notification {
    pub fn order_created(order_id: &str, customer_id: &str) -> Self {
        let message = format!("Order {order_id} created");
        Self {
            channel: "email".to_string(),
            recipient: customer_id.to_string(),
            subject: message.clone(),
            message,
            customer_id: customer_id.to_string(),
            order_id: order_id.to_string(),
            priority: "normal".to_string(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Stands in for the notification service: waits a little, then logs.
pub struct SimulatedNotifier {
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for SimulatedNotifier {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }
}

impl SimulatedNotifier {
    pub fn instant() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl Notifier for SimulatedNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        let delay = rand::thread_rng().gen_range(self.min_delay..=self.max_delay);
        tokio::time::sleep(delay).await;
        info!(
            customer_id = %notification.customer_id,
            message = %notification.message,
            "Notification sent"
        );
        Ok(())
    }
}

pub struct HttpNotifier {
    client: Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NotificationError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .user_agent(crate::SERVICE_NAME)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), NOTIFICATIONS_PATH),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Rejected(status));
        }

        debug!(
            customer_id = %notification.customer_id,
            %status,
            "Notification accepted"
        );
        Ok(())
    }
}

/// Keeps every notification in memory instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *Self::lock(&self.failing) = failing;
    }

    pub fn sent(&self) -> Vec<Notification> {
        Self::lock(&self.sent).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        if *Self::lock(&self.failing) {
            return Err(NotificationError::Unavailable(
                "recording notifier set to fail".to_string(),
            ));
        }
        Self::lock(&self.sent).push(notification.clone());
        Ok(())
    }
}
