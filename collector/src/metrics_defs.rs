//! Metrics definitions for the collector.

use shared::metrics_defs::{MetricDef, MetricType};

pub const FETCH_ATTEMPTS: MetricDef = MetricDef {
    name: "fetch.attempts",
    metric_type: MetricType::Counter,
    description: "Number of scheduled fetches started. Tagged with feed_id, feed_type, agency.",
};

pub const FETCH_SUCCESS: MetricDef = MetricDef {
    name: "fetch.success",
    metric_type: MetricType::Counter,
    description: "Number of fetches that returned a 2xx response",
};

pub const FETCH_ERRORS: MetricDef = MetricDef {
    name: "fetch.errors",
    metric_type: MetricType::Counter,
    description: "Number of failed fetches. Tagged with error_category and error_type.",
};

pub const FETCH_RETRIES: MetricDef = MetricDef {
    name: "fetch.retries",
    metric_type: MetricType::Counter,
    description: "Number of additional attempts made after a retryable failure",
};

pub const FETCH_DURATION: MetricDef = MetricDef {
    name: "fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Duration of the successful fetch attempt in seconds",
};

pub const FETCH_BYTES: MetricDef = MetricDef {
    name: "fetch.bytes",
    metric_type: MetricType::Histogram,
    description: "Response body size in bytes",
};

pub const UPLOAD_SUCCESS: MetricDef = MetricDef {
    name: "upload.success",
    metric_type: MetricType::Counter,
    description: "Number of archived responses written to the object store",
};

pub const UPLOAD_ERRORS: MetricDef = MetricDef {
    name: "upload.errors",
    metric_type: MetricType::Counter,
    description: "Number of failed object store writes. Tagged with error_type.",
};

pub const UPLOAD_DURATION: MetricDef = MetricDef {
    name: "upload.duration",
    metric_type: MetricType::Histogram,
    description: "Time to write payload and metadata in seconds",
};

pub const LAST_ATTEMPT_TIMESTAMP: MetricDef = MetricDef {
    name: "feed.last_attempt_timestamp",
    metric_type: MetricType::Gauge,
    description: "Unix timestamp of the last fetch attempt. Tagged with feed_id.",
};

pub const ACTIVE_FEEDS: MetricDef = MetricDef {
    name: "scheduler.active_feeds",
    metric_type: MetricType::Gauge,
    description: "Number of feeds owned and scheduled by this instance",
};

pub const RUNNING_FEEDS: MetricDef = MetricDef {
    name: "scheduler.running_feeds",
    metric_type: MetricType::Gauge,
    description: "Number of feeds with a fetch currently in progress",
};

pub const TICKS_SKIPPED: MetricDef = MetricDef {
    name: "scheduler.ticks_skipped",
    metric_type: MetricType::Counter,
    description: "Number of dropped ticks. Tagged with feed_id and reason (overlap, misfire).",
};

pub const ALL_METRICS: &[MetricDef] = &[
    FETCH_ATTEMPTS,
    FETCH_SUCCESS,
    FETCH_ERRORS,
    FETCH_RETRIES,
    FETCH_DURATION,
    FETCH_BYTES,
    UPLOAD_SUCCESS,
    UPLOAD_ERRORS,
    UPLOAD_DURATION,
    LAST_ATTEMPT_TIMESTAMP,
    ACTIVE_FEEDS,
    RUNNING_FEEDS,
    TICKS_SKIPPED,
];
