//! Routes decoded events to their type-specific handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

use crate::event::{DecodeError, Event, EventKind};
use crate::fault::InjectedFault;
use crate::notify::Notifier;

pub mod handlers;

pub use handlers::{GenericEventHandler, OrderCreatedHandler, OrderStatusUpdatedHandler};

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Injected(#[from] InjectedFault),
}

/// What a handler did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub handler: &'static str,
    pub notified: bool,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, ProcessingError>;
}

/// Uniformly drawn simulated work duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRange {
    pub min: Duration,
    pub max: Duration,
}

impl WorkRange {
    pub const fn millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    pub async fn simulate(&self) {
        if self.max.is_zero() {
            return;
        }
        let delay = rand::thread_rng().gen_range(self.min..=self.max);
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkTimings {
    pub order_created: WorkRange,
    pub order_status_updated: WorkRange,
    pub generic: WorkRange,
}

impl Default for WorkTimings {
    fn default() -> Self {
        Self {
            order_created: WorkRange::millis(100, 500),
            order_status_updated: WorkRange::millis(50, 200),
            generic: WorkRange::millis(20, 100),
        }
    }
}

impl WorkTimings {
    pub fn instant() -> Self {
        let none = WorkRange::millis(0, 0);
        Self {
            order_created: none,
            order_status_updated: none,
            generic: none,
        }
    }
}

pub struct Dispatcher {
    order_created: OrderCreatedHandler,
    order_status_updated: OrderStatusUpdatedHandler,
    generic: GenericEventHandler,
    registered: HashMap<String, Arc<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, timings: WorkTimings) -> Self {
        Self {
            order_created: OrderCreatedHandler::new(notifier, timings.order_created),
            order_status_updated: OrderStatusUpdatedHandler::new(timings.order_status_updated),
            generic: GenericEventHandler::new(timings.generic),
            registered: HashMap::new(),
        }
    }

    /// Adds a handler for an event type without dedicated handling. Built-in order types
    /// cannot be overridden.
    pub fn register(mut self, event_type: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.registered.insert(event_type.to_string(), handler);
        self
    }

    pub async fn dispatch(&self, event: &Event) -> Result<HandlerOutcome, ProcessingError> {
        match &event.kind {
            EventKind::OrderCreated => self.order_created.handle(event).await,
            EventKind::OrderStatusUpdated => self.order_status_updated.handle(event).await,
            EventKind::Other(event_type) => match self.registered.get(event_type) {
                Some(handler) => handler.handle(event).await,
                None => self.generic.handle(event).await,
            },
        }
    }
}
