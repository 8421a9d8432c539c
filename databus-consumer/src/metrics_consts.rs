// ==== Dispatcher metrics ====
/// Counter for messages enqueued to a worker, labelled by how the worker was chosen
pub const DISPATCHER_MESSAGES_DISPATCHED: &str = "databus_consumer_messages_dispatched_total";

/// Counter for pushes that found the destination queue full
pub const DISPATCHER_BACKPRESSURE_TOTAL: &str = "databus_consumer_queue_backpressure_total";

/// Histogram for time spent blocked on a full worker queue
pub const DISPATCHER_BACKPRESSURE_WAIT_MS: &str = "databus_consumer_queue_backpressure_wait_ms";

/// Counter for offset commits, labelled by kind (batch, message, final) and status
pub const CONSUMER_COMMITS: &str = "databus_consumer_commits_total";

// ==== Poll loop metrics ====
/// Counter for errors reported by the transport
pub const CONSUMER_KAFKA_ERROR: &str = "databus_consumer_kafka_errors_total";

/// Counter for events the loop logs and otherwise ignores
pub const CONSUMER_EVENTS_IGNORED: &str = "databus_consumer_events_ignored_total";

/// Counter for failed topic subscription attempts
pub const CONSUMER_SUBSCRIBE_FAILURES: &str = "databus_consumer_subscribe_failures_total";

// ==== Worker metrics ====
/// Counter for handler invocations, labelled by outcome (ok, error, panic)
pub const WORKER_MESSAGES_HANDLED: &str = "databus_consumer_messages_handled_total";

/// Histogram for handler duration
pub const WORKER_HANDLER_DURATION_MS: &str = "databus_consumer_handler_duration_ms";
