//! Telemetry metric name constants.
//!
//! Centralised metric names for muninn operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `muninn_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider` — cloud provider (e.g. "aws", "azure", "gcp")
//! - `service_type` — service category (e.g. "pricing", "compute")
//! - `operation` — backend operation (e.g. "get", "set", "keys")
//! - `priority` — warming priority ("critical" | "high" | "medium" | "low")
//! - `status` — outcome: "ok", "error" or "skipped"

/// Total cache hits through the unified manager.
///
/// Labels: `provider`, `service_type`.
pub const CACHE_HITS_TOTAL: &str = "muninn_cache_hits_total";

/// Total cache misses through the unified manager (including stale misses).
///
/// Labels: `provider`, `service_type`.
pub const CACHE_MISSES_TOTAL: &str = "muninn_cache_misses_total";

/// Backend operations that failed and were degraded to a no-op.
///
/// Labels: `operation`.
pub const BACKEND_ERRORS_TOTAL: &str = "muninn_cache_backend_errors_total";

/// Reads that flagged a refresh-ahead entry for background refresh.
///
/// Labels: `provider`, `service_type`.
pub const REFRESH_AHEAD_TOTAL: &str = "muninn_refresh_ahead_total";

/// Entries removed by invalidation.
///
/// Labels: `kind` ("pattern" | "tag").
pub const INVALIDATIONS_TOTAL: &str = "muninn_cache_invalidations_total";

/// Requests rejected by the sliding-window rate limiter.
///
/// Labels: `provider`, `service`.
pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "muninn_rate_limit_rejections_total";

/// Rate-limit checks admitted because the backend was unavailable.
///
/// Labels: `provider`.
pub const RATE_LIMIT_FAIL_OPEN_TOTAL: &str = "muninn_rate_limit_fail_open_total";

/// Warming attempts.
///
/// Labels: `priority`, `status` ("ok" | "error" | "skipped").
pub const WARMING_ATTEMPTS_TOTAL: &str = "muninn_warming_attempts_total";

/// Fetch-and-store duration of successful warmings, in seconds.
///
/// Labels: `priority`.
pub const WARMING_DURATION_SECONDS: &str = "muninn_warming_duration_seconds";
