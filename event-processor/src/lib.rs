//! Event processor service.
//!
//! Consumes order events from a partitioned stream, dispatches each event to its handler,
//! persists an idempotent record of the outcome and keeps a bounded cache of recent activity.
//! Processing is driven by a [`supervisor::ProcessingSupervisor`], which the HTTP control
//! surface in [`api`] starts, stops and tunes at runtime.

pub mod api;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod fault;
pub mod health;
pub mod intake;
pub mod metrics;
pub mod metrics_consts;
pub mod notify;
pub mod pipeline;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod telemetry;

/// Tag written to every persisted document and reported by the control API.
pub const SERVICE_NAME: &str = "event-processor";
