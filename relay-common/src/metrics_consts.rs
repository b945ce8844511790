// ==== Producer metrics ====
/// Counter for produce attempts, labelled by outcome
pub const PRODUCE_TOTAL: &str = "relay_produce_total";

/// Histogram for the time between handing a record to the broker and its acknowledgement
pub const PRODUCE_DURATION: &str = "relay_produce_duration_seconds";

// ==== Partition worker metrics ====
/// Counter for messages received from the broker
pub const MESSAGES_RECEIVED: &str = "relay_messages_received_total";

/// Counter for transient partition errors (poll and commit failures)
pub const PARTITION_ERRORS: &str = "relay_partition_errors_total";

/// Counter for partitions stopped by a terminal broker error
pub const PARTITIONS_TERMINATED: &str = "relay_partitions_terminated_total";

/// Gauge for the last committed offset per partition
pub const PARTITION_COMMITTED_OFFSET: &str = "relay_partition_committed_offset";

/// Gauge for running partition workers
pub const PARTITION_WORKERS_ACTIVE: &str = "relay_partition_workers_active";

// ==== Dispatch metrics ====
/// Gauge for dispatches currently running, across all partitions
pub const DISPATCHES_IN_FLIGHT: &str = "relay_dispatches_in_flight";

/// Histogram for handler run time
pub const DISPATCH_DURATION: &str = "relay_dispatch_duration_seconds";

/// Counter for handler failures, labelled by reason (error, panic)
pub const DISPATCH_FAILURES: &str = "relay_dispatch_failures_total";

// ==== HTTP metrics ====
/// Counter for requests served by the probe and metrics router
pub const HTTP_REQUESTS_TOTAL: &str = "relay_http_requests_total";

/// Histogram for request handling time
pub const HTTP_REQUEST_DURATION: &str = "relay_http_request_duration_seconds";
