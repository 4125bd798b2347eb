use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use crate::dispatch::{EventHandler, HandlerOutcome, ProcessingError, WorkRange};
use crate::event::{Event, CUSTOMER_ID_KEYS, ORDER_ID_KEYS, STATUS_KEYS, UNKNOWN};
use crate::metrics_consts::{ERROR_NOTIFICATION, EVENT_PROCESSING_ERRORS, NOTIFICATIONS};
use crate::notify::{Notification, Notifier};

pub struct OrderCreatedHandler {
    notifier: Arc<dyn Notifier>,
    work: WorkRange,
}

impl OrderCreatedHandler {
    pub fn new(notifier: Arc<dyn Notifier>, work: WorkRange) -> Self {
        Self { notifier, work }
    }

    async fn send_notification(&self, order_id: &str, customer_id: &str) -> bool {
        let notification = Notification::order_created(order_id, customer_id);
        match self.notifier.notify(&notification).await {
            Ok(()) => {
                metrics::counter!(NOTIFICATIONS, "status" => "sent").increment(1);
                true
            }
            Err(e) => {
                error!(order_id, customer_id, error = %e, "Failed to send notification");
                metrics::counter!(NOTIFICATIONS, "status" => "failed").increment(1);
                metrics::counter!(EVENT_PROCESSING_ERRORS, "error_type" => ERROR_NOTIFICATION)
                    .increment(1);
                false
            }
        }
    }
}

#[async_trait]
impl EventHandler for OrderCreatedHandler {
    #[instrument(
        name = "handle_order_created",
        skip_all,
        fields(order.id, order.customer_id, order.notified)
    )]
    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, ProcessingError> {
        let order_id = event.field(ORDER_ID_KEYS);
        let customer_id = event.field(CUSTOMER_ID_KEYS);
        let span = tracing::Span::current();
        span.record("order.id", order_id.as_deref().unwrap_or(UNKNOWN));
        span.record("order.customer_id", customer_id.as_deref().unwrap_or(UNKNOWN));

        self.work.simulate().await;

        let order_label = order_id.as_deref().unwrap_or(UNKNOWN);
        let notified = match customer_id.as_deref() {
            Some(customer_id) => self.send_notification(order_label, customer_id).await,
            None => {
                warn!(order_id = order_label, "Order has no customer id, skipping notification");
                false
            }
        };
        span.record("order.notified", notified);

        info!(
            order_id = order_label,
            customer_id = customer_id.as_deref().unwrap_or(UNKNOWN),
            "Order created"
        );

        Ok(HandlerOutcome {
            handler: "order_created",
            notified,
        })
    }
}

pub struct OrderStatusUpdatedHandler {
    work: WorkRange,
}

impl OrderStatusUpdatedHandler {
    pub fn new(work: WorkRange) -> Self {
        Self { work }
    }
}

#[async_trait]
impl EventHandler for OrderStatusUpdatedHandler {
    #[instrument(name = "handle_order_status_updated", skip_all, fields(order.id, order.status))]
    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, ProcessingError> {
        let order_id = event.field(ORDER_ID_KEYS).unwrap_or_else(|| UNKNOWN.to_string());
        let status = event.field(STATUS_KEYS).unwrap_or_else(|| UNKNOWN.to_string());
        let span = tracing::Span::current();
        span.record("order.id", order_id.as_str());
        span.record("order.status", status.as_str());

        self.work.simulate().await;

        info!(%order_id, %status, "Order status updated");

        Ok(HandlerOutcome {
            handler: "order_status_updated",
            notified: false,
        })
    }
}

pub struct GenericEventHandler {
    work: WorkRange,
}

impl GenericEventHandler {
    pub fn new(work: WorkRange) -> Self {
        Self { work }
    }
}

#[async_trait]
impl EventHandler for GenericEventHandler {
    #[instrument(name = "handle_generic_event", skip_all, fields(event.type))]
    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, ProcessingError> {
        tracing::Span::current().record("event.type", event.event_type());
        self.work.simulate().await;

        // Payload values may carry customer data, only the shape is logged
        info!(
            event_type = event.event_type(),
            keys = ?event.payload_keys(),
            "Generic event handled"
        );

        Ok(HandlerOutcome {
            handler: "generic",
            notified: false,
        })
    }
}
