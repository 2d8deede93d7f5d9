//! # Metrics
//!
//! Prometheus metrics for a bootstrap run.
//!
//! ## Metrics Exposed
//!
//! - `gitops_bootstrap_runs_total` - Runs by outcome (done, failed, cancelled)
//! - `gitops_bootstrap_step_duration_seconds` - Duration of each state machine step
//! - `gitops_bootstrap_provider_operations_total` - Provider API calls by provider and operation
//! - `gitops_bootstrap_provider_operation_duration_seconds` - Duration of provider API calls
//! - `gitops_bootstrap_provider_operation_errors_total` - Failed provider API calls
//! - `gitops_bootstrap_provider_mutations_total` - Provider writes (repository, key, commit)
//! - `gitops_bootstrap_commits_total` - Manifest sync results (committed, skipped)
//! - `gitops_bootstrap_retries_total` - Retried transient failures by step
//! - `gitops_bootstrap_readiness_polls_total` - Convergence target polls
//! - `gitops_bootstrap_objects_applied_total` - Objects passed to server-side apply
//!
//! A bootstrap is a one-shot process, so metrics are written once in text
//! format with [`write_metrics_file`] (node-exporter textfile collector style).

use anyhow::{Context, Result};
use prometheus::{Encoder, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::path::Path;
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RUNS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("gitops_bootstrap_runs_total", "Bootstrap runs by outcome"),
        &["outcome"],
    )
    .expect("Failed to create RUNS_TOTAL metric - this should never happen")
});

static STEP_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "gitops_bootstrap_step_duration_seconds",
            "Duration of bootstrap steps in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["step"],
    )
    .expect("Failed to create STEP_DURATION metric - this should never happen")
});

static PROVIDER_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "gitops_bootstrap_provider_operations_total",
            "Total number of provider operations by provider and operation",
        ),
        &["provider", "operation"],
    )
    .expect("Failed to create PROVIDER_OPERATIONS_TOTAL metric - this should never happen")
});

static PROVIDER_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "gitops_bootstrap_provider_operation_duration_seconds",
            "Duration of provider operations in seconds by provider",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["provider"],
    )
    .expect("Failed to create PROVIDER_OPERATION_DURATION metric - this should never happen")
});

static PROVIDER_OPERATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "gitops_bootstrap_provider_operation_errors_total",
            "Total number of provider operation errors by provider",
        ),
        &["provider"],
    )
    .expect("Failed to create PROVIDER_OPERATION_ERRORS_TOTAL metric - this should never happen")
});

static PROVIDER_MUTATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "gitops_bootstrap_provider_mutations_total",
            "Total number of provider writes by provider and operation",
        ),
        &["provider", "operation"],
    )
    .expect("Failed to create PROVIDER_MUTATIONS_TOTAL metric - this should never happen")
});

static COMMITS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "gitops_bootstrap_commits_total",
            "Manifest synchronization results",
        ),
        &["result"],
    )
    .expect("Failed to create COMMITS_TOTAL metric - this should never happen")
});

static RETRIES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "gitops_bootstrap_retries_total",
            "Transient failures retried by step",
        ),
        &["step"],
    )
    .expect("Failed to create RETRIES_TOTAL metric - this should never happen")
});

static READINESS_POLLS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_bootstrap_readiness_polls_total",
        "Total number of convergence target polls",
    )
    .expect("Failed to create READINESS_POLLS_TOTAL metric - this should never happen")
});

static OBJECTS_APPLIED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_bootstrap_objects_applied_total",
        "Total number of objects passed to server-side apply",
    )
    .expect("Failed to create OBJECTS_APPLIED_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RUNS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STEP_DURATION.clone()))?;
    REGISTRY.register(Box::new(PROVIDER_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROVIDER_OPERATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(PROVIDER_OPERATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROVIDER_MUTATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(READINESS_POLLS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OBJECTS_APPLIED_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_runs(outcome: &str) {
    RUNS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_step_duration(step: &str, duration: f64) {
    STEP_DURATION.with_label_values(&[step]).observe(duration);
}

pub fn record_provider_operation(provider: &str, operation: &str, duration: f64) {
    PROVIDER_OPERATIONS_TOTAL
        .with_label_values(&[provider, operation])
        .inc();
    PROVIDER_OPERATION_DURATION
        .with_label_values(&[provider])
        .observe(duration);
}

/// Increment provider operation errors counter
pub fn increment_provider_operation_errors(provider: &str) {
    PROVIDER_OPERATION_ERRORS_TOTAL
        .with_label_values(&[provider])
        .inc();
}

pub fn increment_provider_mutations(provider: &str, operation: &str) {
    PROVIDER_MUTATIONS_TOTAL
        .with_label_values(&[provider, operation])
        .inc();
}

pub fn increment_commits(result: &str) {
    COMMITS_TOTAL.with_label_values(&[result]).inc();
}

pub fn increment_retries(step: &str) {
    RETRIES_TOTAL.with_label_values(&[step]).inc();
}

pub fn increment_readiness_polls() {
    READINESS_POLLS_TOTAL.inc();
}

pub fn increment_objects_applied(count: u64) {
    OBJECTS_APPLIED_TOTAL.inc_by(count);
}

/// Render every registered metric in Prometheus text format
pub fn gather_text() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
}

/// Write the metrics text to `path`
pub fn write_metrics_file(path: &Path) -> Result<()> {
    let text = gather_text()?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write metrics to {}", path.display()))
}
