// ==== Event processing metrics ====
/// Counter for successfully processed events, labelled by event_type and source
pub const EVENTS_PROCESSED: &str = "events_processed_total";

/// Counter for processing errors, labelled by error_type
pub const EVENT_PROCESSING_ERRORS: &str = "event_processing_errors_total";

/// Histogram for per-event processing time in seconds
pub const EVENT_PROCESSING_DURATION: &str = "event_processing_duration_seconds";

// ==== Intake loop metrics ====
/// Histogram for the number of records in each received batch
pub const BATCH_SIZE: &str = "event_batch_size";

/// Counter for partition checkpoints, labelled by status
pub const CHECKPOINTS: &str = "partition_checkpoints_total";

/// Gauge set to 1 while the intake loop runs
pub const PROCESSOR_RUNNING: &str = "event_processor_running";

// ==== Side channel metrics ====
/// Counter for store writes, labelled by outcome (stored, duplicate, failed)
pub const STORE_WRITES: &str = "processed_event_store_writes_total";

/// Counter for recent activity cache writes, labelled by status
pub const CACHE_WRITES: &str = "recent_activity_cache_writes_total";

/// Counter for notifications sent by order handlers, labelled by status
pub const NOTIFICATIONS: &str = "notifications_total";

/// Counter for injected latency and errors, labelled by operation and kind
pub const FAILURE_INJECTIONS: &str = "failure_injections_total";

// ==== error_type label values ====
pub const ERROR_PROCESSING: &str = "processing_error";
pub const ERROR_MALFORMED_PAYLOAD: &str = "malformed_payload";
pub const ERROR_STORE: &str = "store_error";
pub const ERROR_CACHE: &str = "cache_error";
pub const ERROR_NOTIFICATION: &str = "notification_error";
pub const ERROR_PARTITION: &str = "partition_error";
pub const ERROR_CHECKPOINT: &str = "checkpoint_error";
pub const ERROR_CONSUMER: &str = "consumer_error";
