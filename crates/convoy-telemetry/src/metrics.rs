//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters relevant to apply runs, client retries, and the
//!   media pipeline.

use std::sync::Arc;

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Prometheus-backed metrics registry shared across components.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    stage_events_total: IntCounterVec,
    client_retries_total: IntCounterVec,
    pipeline_items_total: IntCounterVec,
    apply_runs_total: IntCounterVec,
    active_run: IntGauge,
    state_recoveries_total: IntCounter,
}

/// Snapshot of selected counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Whether an apply run is currently executing.
    pub active_run: i64,
    /// Total corrupt state files recovered since start.
    pub state_recoveries_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let stage_events_total = IntCounterVec::new(
            Opts::new("stage_events_total", "Apply stage events by status"),
            &["stage", "status"],
        )?;
        let client_retries_total = IntCounterVec::new(
            Opts::new("client_retries_total", "HTTP retries by service"),
            &["service"],
        )?;
        let pipeline_items_total = IntCounterVec::new(
            Opts::new("pipeline_items_total", "Pipeline items processed by status"),
            &["status"],
        )?;
        let apply_runs_total = IntCounterVec::new(
            Opts::new("apply_runs_total", "Completed apply runs by outcome"),
            &["outcome"],
        )?;
        let active_run = IntGauge::with_opts(Opts::new(
            "apply_run_active",
            "Whether an apply run is executing",
        ))?;
        let state_recoveries_total = IntCounter::with_opts(Opts::new(
            "state_recoveries_total",
            "Corrupt state files recovered",
        ))?;

        registry.register(Box::new(stage_events_total.clone()))?;
        registry.register(Box::new(client_retries_total.clone()))?;
        registry.register(Box::new(pipeline_items_total.clone()))?;
        registry.register(Box::new(apply_runs_total.clone()))?;
        registry.register(Box::new(active_run.clone()))?;
        registry.register(Box::new(state_recoveries_total.clone()))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                stage_events_total,
                client_retries_total,
                pipeline_items_total,
                apply_runs_total,
                active_run,
                state_recoveries_total,
            }),
        })
    }

    /// Record a stage event emission.
    pub fn inc_stage_event(&self, stage: &str, status: &str) {
        self.inner
            .stage_events_total
            .with_label_values(&[stage, status])
            .inc();
    }

    /// Record an HTTP retry against a managed service.
    pub fn inc_client_retry(&self, service: &str) {
        self.inner
            .client_retries_total
            .with_label_values(&[service])
            .inc();
    }

    /// Record a processed pipeline item with its ledger status.
    pub fn inc_pipeline_item(&self, status: &str) {
        self.inner
            .pipeline_items_total
            .with_label_values(&[status])
            .inc();
    }

    /// Record a completed apply run outcome (`ok` or `failed`).
    pub fn inc_apply_run(&self, outcome: &str) {
        self.inner
            .apply_runs_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Mark whether an apply run is currently executing.
    pub fn set_active_run(&self, active: bool) {
        self.inner.active_run.set(i64::from(active));
    }

    /// Record a corrupt state file recovery.
    pub fn inc_state_recovery(&self) {
        self.inner.state_recoveries_total.inc();
    }

    /// Snapshot of selected collectors.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_run: self.inner.active_run.get(),
            state_recoveries_total: self.inner.state_recoveries_total.get(),
        }
    }

    /// Render the registry in Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.inner.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_exposition_format() {
        let metrics = Metrics::new().expect("registry");
        metrics.inc_stage_event("validate", "ok");
        metrics.inc_client_retry("sonarr");
        metrics.inc_pipeline_item("ok");
        metrics.inc_apply_run("ok");
        metrics.set_active_run(true);
        metrics.inc_state_recovery();

        let rendered = metrics.render().expect("render");
        assert!(rendered.contains("stage_events_total"));
        assert!(rendered.contains("client_retries_total"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_run, 1);
        assert_eq!(snapshot.state_recoveries_total, 1);
    }
}
