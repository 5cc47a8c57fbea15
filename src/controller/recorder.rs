//! Condition recording and event emission
//!
//! Every condition mutation goes through the `ConditionRecorder`, which
//! guarantees the three recording rules: setting a condition to its current
//! value is a no-op and emits nothing; any change refreshes
//! lastTransitionTime; transitions to a bad status always emit a Warning
//! event, while transitions to a good status emit a Normal event only when
//! the caller broadcasts or `RECORD_LEVEL=verbose` is set.
//!
//! The sink itself is fire-and-forget: publish failures are logged and
//! swallowed, never surfaced to the reconcile loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::crd::experiment::{epoch_millis, Experiment, ExperimentStatus};

/// Environment variable upgrading Normal-event emission to verbose.
pub const RECORD_LEVEL_ENV: &str = "RECORD_LEVEL";

const REPORTING_CONTROLLER: &str = "iter8-controller";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Trait for publishing Kubernetes events about an Experiment
///
/// Production code uses `KubeEventSink` backed by the cluster event API.
/// Tests use `MockEventSink` which stores events in memory for assertions.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, experiment: &Experiment, kind: EventKind, reason: &str, message: &str);
}

/// Production sink writing core/v1 Events through the cluster API.
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        Self {
            recorder: Recorder::new(client, REPORTING_CONTROLLER.to_string().into()),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, experiment: &Experiment, kind: EventKind, reason: &str, message: &str) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        let reference = experiment.object_ref(&());
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(error = %e, reason, "Failed to publish event (non-fatal)");
        }
    }
}

/// Mock event sink for testing - stores events in memory
#[cfg(test)]
#[derive(Default)]
pub struct MockEventSink {
    events: std::sync::Mutex<Vec<(EventKind, String, String)>>,
}

#[cfg(test)]
impl MockEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)]
    pub fn emitted(&self) -> Vec<(EventKind, String, String)> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for MockEventSink {
    async fn publish(&self, _experiment: &Experiment, kind: EventKind, reason: &str, message: &str) {
        #[allow(clippy::unwrap_used)]
        self.events
            .lock()
            .unwrap()
            .push((kind, reason.to_string(), message.to_string()));
    }
}

/// Idempotent status-condition setter that emits cluster events on
/// transitions.
pub struct ConditionRecorder {
    sink: Arc<dyn EventSink>,
    verbose: bool,
}

fn status_mut(experiment: &mut Experiment) -> &mut ExperimentStatus {
    experiment.status.get_or_insert_with(Default::default)
}

impl ConditionRecorder {
    /// Builds a recorder reading event verbosity from `RECORD_LEVEL`.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let verbose = std::env::var(RECORD_LEVEL_ENV)
            .map(|v| v == "verbose")
            .unwrap_or(false);
        Self { sink, verbose }
    }

    pub fn with_verbosity(sink: Arc<dyn EventSink>, verbose: bool) -> Self {
        Self { sink, verbose }
    }

    async fn normal(&self, broadcast: bool, experiment: &Experiment, reason: &str, message: &str) {
        if broadcast || self.verbose {
            self.sink
                .publish(experiment, EventKind::Normal, reason, message)
                .await;
        }
    }

    pub async fn mark_targets_error(
        &self,
        experiment: &mut Experiment,
        message: &str,
        now: DateTime<Utc>,
    ) {
        self.mark_targets_error_with_reason(experiment, "TargetsNotFound", message, now)
            .await;
    }

    /// Variant carrying a caller-chosen reason (`AlreadyControlled`,
    /// `UnsupportedAPIVersion`, `InvalidSpec`).
    pub async fn mark_targets_error_with_reason(
        &self,
        experiment: &mut Experiment,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let changed = status_mut(experiment).mark_targets_error(reason, message, now);
        info!(reason, message, "targets unavailable");
        if changed {
            self.sink
                .publish(experiment, EventKind::Warning, reason, message)
                .await;
        }
    }

    pub async fn mark_targets_found(&self, experiment: &mut Experiment, now: DateTime<Utc>) {
        if status_mut(experiment).mark_targets_found(now) {
            self.normal(true, experiment, "TargetsFound", "").await;
        }
    }

    pub async fn mark_analytics_error(
        &self,
        experiment: &mut Experiment,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let changed = status_mut(experiment).mark_analytics_error(message, now);
        info!(reason = "AnalyticsServiceError", message, "analytics unavailable");
        if changed {
            self.sink
                .publish(experiment, EventKind::Warning, "AnalyticsServiceError", message)
                .await;
        }
    }

    pub async fn mark_analytics_running(&self, experiment: &mut Experiment, now: DateTime<Utc>) {
        if status_mut(experiment).mark_analytics_running(now) {
            self.normal(true, experiment, "AnalyticsServiceRunning", "")
                .await;
        }
    }

    pub async fn mark_sync_metrics(&self, experiment: &mut Experiment, now: DateTime<Utc>) {
        if status_mut(experiment).mark_metrics_synced(now) {
            self.normal(true, experiment, "SyncMetricsSucceeded", "").await;
        }
    }

    pub async fn mark_sync_metrics_error(
        &self,
        experiment: &mut Experiment,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let changed = status_mut(experiment).mark_metrics_sync_error(message, now);
        info!(reason = "SyncMetricsError", message, "metric sync failed");
        if changed {
            self.sink
                .publish(experiment, EventKind::Warning, "SyncMetricsError", message)
                .await;
        }
    }

    pub async fn mark_routing_rules_ready(
        &self,
        experiment: &mut Experiment,
        message: &str,
        now: DateTime<Utc>,
    ) {
        if status_mut(experiment).mark_routing_rules_ready(now) {
            self.normal(true, experiment, "RoutingRulesReady", message)
                .await;
        }
    }

    pub async fn mark_routing_rules_error(
        &self,
        experiment: &mut Experiment,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let changed = status_mut(experiment).mark_routing_rules_error(message, now);
        info!(reason = "RoutingRulesError", message, "routing rules failed");
        if changed {
            self.sink
                .publish(experiment, EventKind::Warning, "RoutingRulesError", message)
                .await;
        }
    }

    pub async fn mark_experiment_progress(
        &self,
        experiment: &mut Experiment,
        broadcast: bool,
        message: &str,
        now: DateTime<Utc>,
    ) {
        if status_mut(experiment).mark_experiment_progress(message, now) {
            self.normal(broadcast, experiment, "ProgressUpdate", message)
                .await;
        }
    }

    pub async fn mark_experiment_succeeded(
        &self,
        experiment: &mut Experiment,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let changed = status_mut(experiment).mark_experiment_succeeded(message, now);
        complete_experiment(experiment, now);
        info!(reason = "ExperimentSucceeded", message, "experiment completed");
        if changed {
            self.normal(true, experiment, "ExperimentSucceeded", message)
                .await;
        }
    }

    pub async fn mark_experiment_failed(
        &self,
        experiment: &mut Experiment,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let changed = status_mut(experiment).mark_experiment_failed(message, now);
        complete_experiment(experiment, now);
        info!(reason = "ExperimentFailed", message, "experiment completed");
        if changed {
            self.sink
                .publish(experiment, EventKind::Warning, "ExperimentFailed", message)
                .await;
        }
    }

    pub async fn mark_experiment_aborted(
        &self,
        experiment: &mut Experiment,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let changed = status_mut(experiment).mark_experiment_aborted(message, now);
        complete_experiment(experiment, now);
        info!(reason = "Aborted", message, "experiment aborted");
        if changed {
            self.sink
                .publish(experiment, EventKind::Warning, "Aborted", message)
                .await;
        }
    }
}

/// Terminal bookkeeping shared by every completion path: stamp the end of
/// the experiment window, refresh the dashboard link, and reset the opaque
/// analytics state.
fn complete_experiment(experiment: &mut Experiment, now: DateTime<Utc>) {
    {
        let status = status_mut(experiment);
        status.analysis_state = json!({});
        status.end_timestamp = epoch_millis(now);
    }
    let url = experiment.grafana_url();
    status_mut(experiment).grafana_url = Some(url);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "recorder_test.rs"]
mod tests;
