//! Prometheus metrics for the controller itself
//!
//! Tracks reconciliation counts and durations per traffic driver plus the
//! currently applied traffic percentages per experiment. Exposed through
//! the health server's `/metrics` endpoint.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Shared handle to the controller metrics registry
pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    traffic_percentage: IntGaugeVec,
}

/// Create the metrics registry with all controller metrics registered
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    let registry = Registry::new();

    let reconciliations = IntCounterVec::new(
        Opts::new(
            "iter8_reconciliations_total",
            "Total reconciliations by driver and outcome",
        ),
        &["driver", "outcome"],
    )?;
    registry.register(Box::new(reconciliations.clone()))?;

    let reconcile_duration = HistogramVec::new(
        HistogramOpts::new(
            "iter8_reconcile_duration_seconds",
            "Reconciliation duration by driver",
        ),
        &["driver"],
    )?;
    registry.register(Box::new(reconcile_duration.clone()))?;

    let traffic_percentage = IntGaugeVec::new(
        Opts::new(
            "iter8_traffic_percentage",
            "Currently applied traffic percentage per experiment and revision role",
        ),
        &["namespace", "experiment", "role"],
    )?;
    registry.register(Box::new(traffic_percentage.clone()))?;

    Ok(Arc::new(ControllerMetrics {
        registry,
        reconciliations,
        reconcile_duration,
        traffic_percentage,
    }))
}

impl ControllerMetrics {
    pub fn record_reconciliation(&self, driver: &str, seconds: f64) {
        self.reconciliations
            .with_label_values(&[driver, "success"])
            .inc();
        self.reconcile_duration
            .with_label_values(&[driver])
            .observe(seconds);
    }

    pub fn record_reconciliation_error(&self, driver: &str, seconds: f64) {
        self.reconciliations
            .with_label_values(&[driver, "error"])
            .inc();
        self.reconcile_duration
            .with_label_values(&[driver])
            .observe(seconds);
    }

    pub fn set_traffic_split(&self, namespace: &str, experiment: &str, baseline: i32, candidate: i32) {
        self.traffic_percentage
            .with_label_values(&[namespace, experiment, "baseline"])
            .set(baseline as i64);
        self.traffic_percentage
            .with_label_values(&[namespace, experiment, "candidate"])
            .set(candidate as i64);
    }

    /// Encode all metrics in Prometheus text format for scraping
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
