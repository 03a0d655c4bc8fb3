//! Metric instrument factories for quarry.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"quarry"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("quarry")
}

/// Counter: work items pushed into a queue.
/// Labels: `queue`, `result` ("ok" | "duplicate" | "error").
pub fn work_pushed() -> Counter<u64> {
    meter()
        .u64_counter("quarry.work.pushed")
        .with_description("Number of work items pushed")
        .build()
}

/// Counter: work items claimed from a queue.
/// Labels: `queue`, `work_type`.
pub fn work_claimed() -> Counter<u64> {
    meter()
        .u64_counter("quarry.work.claimed")
        .with_description("Number of work items claimed")
        .build()
}

/// Counter: addressed-work completions detected by the fallback ticker
/// instead of a notification. A rising rate means events are being lost.
/// Labels: `queue`.
pub fn notification_misses() -> Counter<u64> {
    meter()
        .u64_counter("quarry.poll.notification_misses")
        .with_description("Address completions detected by polling fallback")
        .build()
}

/// Histogram: job execution duration in milliseconds.
/// Labels: `queue`, `work_type`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("quarry.job.duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
