//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes a minimal set of counters/gauges relevant to the pipeline.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Prometheus-backed metrics registry shared across pipeline services.
#[derive(Clone)]
pub struct Metrics {
    inner: std::sync::Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    transitions_total: IntCounterVec,
    stage_failures_total: IntCounterVec,
    retries_scheduled_total: IntCounterVec,
    events_emitted_total: IntCounterVec,
    items_completed_total: IntCounter,
    items_failed_total: IntCounter,
    deliveries_in_flight: IntGauge,
    eligible_queue_depth: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Items that reached `completed` since startup.
    pub items_completed_total: u64,
    /// Items that reached `failed` since startup.
    pub items_failed_total: u64,
    /// Server deliveries currently in flight.
    pub deliveries_in_flight: i64,
    /// Eligible items observed by the most recent scheduler sweep.
    pub eligible_queue_depth: i64,
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

        let transitions_total = IntCounterVec::new(
            Opts::new("pipeline_transitions_total", "Item status transitions"),
            &["to"],
        )?;
        let stage_failures_total = IntCounterVec::new(
            Opts::new(
                "pipeline_stage_failures_total",
                "Stage errors routed through the retry policy, by classified kind",
            ),
            &["stage", "kind"],
        )?;
        let retries_scheduled_total = IntCounterVec::new(
            Opts::new(
                "pipeline_retries_scheduled_total",
                "Retry gates written, by mode (retry or skip)",
            ),
            &["mode"],
        )?;
        let events_emitted_total = IntCounterVec::new(
            Opts::new("pipeline_events_emitted_total", "Domain events emitted by type"),
            &["type"],
        )?;
        let items_completed_total = IntCounter::with_opts(Opts::new(
            "pipeline_items_completed_total",
            "Items delivered to every target server",
        ))?;
        let items_failed_total = IntCounter::with_opts(Opts::new(
            "pipeline_items_failed_total",
            "Items that failed terminally",
        ))?;
        let deliveries_in_flight = IntGauge::with_opts(Opts::new(
            "pipeline_deliveries_in_flight",
            "Server deliveries currently streaming",
        ))?;
        let eligible_queue_depth = IntGauge::with_opts(Opts::new(
            "pipeline_eligible_queue_depth",
            "Eligible items observed by the most recent sweep",
        ))?;

        registry.register(Box::new(transitions_total.clone()))?;
        registry.register(Box::new(stage_failures_total.clone()))?;
        registry.register(Box::new(retries_scheduled_total.clone()))?;
        registry.register(Box::new(events_emitted_total.clone()))?;
        registry.register(Box::new(items_completed_total.clone()))?;
        registry.register(Box::new(items_failed_total.clone()))?;
        registry.register(Box::new(deliveries_in_flight.clone()))?;
        registry.register(Box::new(eligible_queue_depth.clone()))?;

        Ok(Self {
            inner: std::sync::Arc::new(MetricsInner {
                registry,
                transitions_total,
                stage_failures_total,
                retries_scheduled_total,
                events_emitted_total,
                items_completed_total,
                items_failed_total,
                deliveries_in_flight,
                eligible_queue_depth,
            }),
        })
    }

    /// Record a status transition into `to`.
    pub fn record_transition(&self, to: &str) {
        self.inner.transitions_total.with_label_values(&[to]).inc();
        if to == "completed" {
            self.inner.items_completed_total.inc();
        } else if to == "failed" {
            self.inner.items_failed_total.inc();
        }
    }

    /// Record a stage error routed through the retry policy.
    pub fn record_stage_failure(&self, stage: &str, kind: &str) {
        self.inner
            .stage_failures_total
            .with_label_values(&[stage, kind])
            .inc();
    }

    /// Record a scheduled retry gate; `skip` distinguishes the two modes.
    pub fn record_retry_scheduled(&self, skip: bool) {
        let mode = if skip { "skip" } else { "retry" };
        self.inner
            .retries_scheduled_total
            .with_label_values(&[mode])
            .inc();
    }

    /// Record an emitted domain event by discriminator.
    pub fn record_event(&self, kind: &str) {
        self.inner
            .events_emitted_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Adjust the number of deliveries currently streaming.
    pub fn set_deliveries_in_flight(&self, value: i64) {
        self.inner.deliveries_in_flight.set(value);
    }

    /// Record the eligible queue depth observed by a scheduler sweep.
    pub fn set_eligible_queue_depth(&self, value: i64) {
        self.inner.eligible_queue_depth.set(value);
    }

    /// Produce a serialisable snapshot of the key gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_completed_total: self.inner.items_completed_total.get(),
            items_failed_total: self.inner.items_failed_total.get(),
            deliveries_in_flight: self.inner.deliveries_in_flight.get(),
            eligible_queue_depth: self.inner.eligible_queue_depth.get(),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.inner.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_feed_terminal_counters() {
        let metrics = Metrics::new().expect("metrics registry");
        metrics.record_transition("searching");
        metrics.record_transition("completed");
        metrics.record_transition("failed");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_completed_total, 1);
        assert_eq!(snapshot.items_failed_total, 1);
    }

    #[test]
    fn gauges_reflect_latest_values() {
        let metrics = Metrics::new().expect("metrics registry");
        metrics.set_deliveries_in_flight(4);
        metrics.set_eligible_queue_depth(17);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.deliveries_in_flight, 4);
        assert_eq!(snapshot.eligible_queue_depth, 17);
    }

    #[test]
    fn render_emits_text_format() {
        let metrics = Metrics::new().expect("metrics registry");
        metrics.record_stage_failure("download", "network_timeout");
        metrics.record_retry_scheduled(true);
        metrics.record_event("status_changed");

        let rendered = metrics.render().expect("render");
        assert!(rendered.contains("pipeline_stage_failures_total"));
        assert!(rendered.contains("pipeline_retries_scheduled_total"));
    }
}
