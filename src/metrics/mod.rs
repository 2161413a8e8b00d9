//! Prometheus metrics for the orchestration engine.
//!
//! Metrics are optional: every recording helper is a no-op until
//! `init_metrics` has run, so library users and tests pay nothing.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global registry for all engine metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs reaching a terminal status, labeled by status.
static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Current number of queued jobs.
static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Current number of live worker sessions.
static ACTIVE_SESSIONS: OnceLock<Gauge> = OnceLock::new();

/// Execution wall time in seconds.
static EXECUTION_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Domain events dropped by slow subscribers.
static EVENTS_DROPPED: OnceLock<IntCounter> = OnceLock::new();

/// Artifact cache query results, labeled hit/miss.
static ARTIFACT_CACHE_LOOKUPS: OnceLock<CounterVec> = OnceLock::new();

/// Worker provisioning failures, labeled by error kind.
static PROVISION_FAILURES: OnceLock<CounterVec> = OnceLock::new();

/// Registers all metrics. Call once at startup; later calls are no-ops.
pub fn init_metrics() {
    let registry = REGISTRY.get_or_init(Registry::new);

    let jobs_total = JOBS_TOTAL.get_or_init(|| {
        CounterVec::new(
            Opts::new("hodei_jobs_total", "Jobs reaching a terminal status"),
            &["status"],
        )
        .expect("valid metric definition")
    });
    let queue_depth = QUEUE_DEPTH.get_or_init(|| {
        Gauge::new("hodei_queue_depth", "Jobs currently queued").expect("valid metric definition")
    });
    let active_sessions = ACTIVE_SESSIONS.get_or_init(|| {
        Gauge::new("hodei_active_sessions", "Live worker sessions")
            .expect("valid metric definition")
    });
    let execution_duration = EXECUTION_DURATION.get_or_init(|| {
        Histogram::with_opts(HistogramOpts::new(
            "hodei_execution_duration_seconds",
            "Execution wall time",
        ))
        .expect("valid metric definition")
    });
    let events_dropped = EVENTS_DROPPED.get_or_init(|| {
        IntCounter::new(
            "hodei_events_dropped_total",
            "Domain events dropped by slow subscribers",
        )
        .expect("valid metric definition")
    });
    let cache_lookups = ARTIFACT_CACHE_LOOKUPS.get_or_init(|| {
        CounterVec::new(
            Opts::new(
                "hodei_artifact_cache_lookups_total",
                "Artifact cache query results",
            ),
            &["result"],
        )
        .expect("valid metric definition")
    });
    let provision_failures = PROVISION_FAILURES.get_or_init(|| {
        CounterVec::new(
            Opts::new(
                "hodei_provision_failures_total",
                "Worker provisioning failures",
            ),
            &["kind"],
        )
        .expect("valid metric definition")
    });

    // Double registration only happens if init runs twice; ignore it.
    let _ = registry.register(Box::new(jobs_total.clone()));
    let _ = registry.register(Box::new(queue_depth.clone()));
    let _ = registry.register(Box::new(active_sessions.clone()));
    let _ = registry.register(Box::new(execution_duration.clone()));
    let _ = registry.register(Box::new(events_dropped.clone()));
    let _ = registry.register(Box::new(cache_lookups.clone()));
    let _ = registry.register(Box::new(provision_failures.clone()));
}

/// Records a job reaching a terminal status.
pub fn record_job_terminal(status: &str) {
    if let Some(counter) = JOBS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Updates the queued-jobs gauge.
pub fn set_queue_depth(depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.set(depth as f64);
    }
}

/// Updates the live-sessions gauge.
pub fn set_active_sessions(count: usize) {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.set(count as f64);
    }
}

/// Records the wall time of a finished execution.
pub fn observe_execution_duration(seconds: f64) {
    if let Some(histogram) = EXECUTION_DURATION.get() {
        histogram.observe(seconds);
    }
}

/// Records dropped domain events.
pub fn record_events_dropped(count: u64) {
    if let Some(counter) = EVENTS_DROPPED.get() {
        counter.inc_by(count);
    }
}

/// Records artifact cache hits and misses.
pub fn record_cache_lookup(hits: usize, misses: usize) {
    if let Some(counter) = ARTIFACT_CACHE_LOOKUPS.get() {
        counter.with_label_values(&["hit"]).inc_by(hits as f64);
        counter.with_label_values(&["miss"]).inc_by(misses as f64);
    }
}

/// Records a provisioning failure by kind.
pub fn record_provision_failure(kind: &str) {
    if let Some(counter) = PROVISION_FAILURES.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

/// Renders all registered metrics in the Prometheus text format.
pub fn export() -> String {
    let registry = match REGISTRY.get() {
        Some(registry) => registry,
        None => return String::new(),
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_are_noops_before_init() {
        // Must not panic without init.
        record_job_terminal("completed");
        set_queue_depth(3);
        record_events_dropped(2);
    }

    #[test]
    fn test_init_and_export() {
        init_metrics();
        init_metrics(); // idempotent

        record_job_terminal("completed");
        set_queue_depth(5);
        set_active_sessions(2);
        observe_execution_duration(1.5);
        record_cache_lookup(2, 1);
        record_provision_failure("timeout");

        let text = export();
        assert!(text.contains("hodei_jobs_total"));
        assert!(text.contains("hodei_queue_depth"));
        assert!(text.contains("hodei_artifact_cache_lookups_total"));
    }
}
