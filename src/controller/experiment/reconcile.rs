use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::iteration::{run_iteration, IterationDeps, TRANSIENT_REQUEUE};
use super::validation::validate_experiment;
use crate::controller::analytics::AnalyticsService;
use crate::controller::catalog;
use crate::controller::clock::Clock;
use crate::controller::drivers::{select_driver, DriverError, TrafficDriver};
use crate::controller::recorder::{ConditionRecorder, EventSink};
use crate::crd::experiment::{
    epoch_millis, ConditionStatus, Experiment, ExperimentConditionType, FINALIZER,
};
use crate::server::SharedMetrics;

/// Attempts for one status persist before the error bubbles out.
const STATUS_UPDATE_ATTEMPTS: u32 = 3;
const STATUS_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Requeue used while an Experiment's creation timestamp has not passed.
const CREATION_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Experiment missing namespace")]
    MissingNamespace,
}

/// Controller context shared by every reconcile invocation.
pub struct Context {
    pub client: Client,
    pub analytics: Arc<dyn AnalyticsService>,
    pub recorder: ConditionRecorder,
    pub clock: Arc<dyn Clock>,
    /// Namespace searched first for the metric catalog.
    pub controller_namespace: String,
    /// Optional controller metrics for Prometheus
    /// When Some, records reconciliation counts and durations
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        client: Client,
        analytics: Arc<dyn AnalyticsService>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        controller_namespace: String,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            client,
            analytics,
            recorder: ConditionRecorder::new(sink),
            clock,
            controller_namespace,
            metrics,
        }
    }
}

/// Reconcile an Experiment resource
///
/// Level-triggered control loop converging cluster routing state toward the
/// declared experiment intent, phase by phase, each a guarded short-circuit:
/// finalizer installation, deletion, completion guard, timestamp bootstrap,
/// creation debounce, condition initialization, metric sync, driver
/// dispatch, the iteration core, and a single status persist at the end.
///
/// Idempotent: reconciling twice with unchanged cluster state and an
/// unchanged clock produces byte-identical status.
pub async fn reconcile(
    experiment: Arc<Experiment>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let start = std::time::Instant::now();
    let namespace = experiment
        .namespace()
        .ok_or(ReconcileError::MissingNamespace)?;
    let name = experiment.name_any();
    let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), &namespace);
    let now = ctx.clock.now();

    info!(experiment = %name, namespace = %namespace, "reconciling");

    let mut experiment = (*experiment).clone();

    // Finalizer installation. A failed patch is logged and retried on the
    // next notification.
    if experiment.metadata.deletion_timestamp.is_none() && !has_finalizer(&experiment) {
        add_finalizer(&api, &mut experiment).await;
    }

    // Deletion branch: roll traffic back unless completed, then let the
    // object be garbage-collected.
    if experiment.metadata.deletion_timestamp.is_some() {
        return finalize(&api, &mut experiment, &ctx).await;
    }

    // Completion is terminal.
    if experiment
        .status
        .as_ref()
        .map(|s| s.completed())
        .unwrap_or(false)
    {
        info!(experiment = %name, "experiment completed; use a new name to start another");
        return Ok(Action::await_change());
    }

    bootstrap_status(&mut experiment, now);

    // A creation timestamp at or past the observed now means the API
    // server's clock runs ahead of ours; wait out the skew before acting.
    if let Some(created) = experiment.metadata.creation_timestamp.as_ref() {
        if created.0 >= now {
            return Ok(Action::requeue(CREATION_DEBOUNCE));
        }
    }

    if let Some(status) = experiment.status.as_mut() {
        status.init_conditions(now);
    }

    if let Err(message) = validate_experiment(&experiment) {
        ctx.recorder
            .mark_targets_error_with_reason(&mut experiment, "InvalidSpec", &message, now)
            .await;
        persist_status(&api, &experiment).await?;
        return Ok(Action::await_change());
    }

    // Metric sync runs until it succeeds once; the resolved definitions
    // live in status from then on.
    let metrics_synced = experiment
        .status
        .as_ref()
        .and_then(|s| s.condition(ExperimentConditionType::MetricsSynced))
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false);
    if !metrics_synced {
        match catalog::sync_metrics(&ctx.client, &ctx.controller_namespace, &experiment).await {
            Ok(metrics) => {
                if let Some(status) = experiment.status.as_mut() {
                    status.metrics = metrics;
                }
                ctx.recorder.mark_sync_metrics(&mut experiment, now).await;
            }
            Err(err) => {
                let message = format!("Fail to read metrics: {}", err);
                ctx.recorder
                    .mark_sync_metrics_error(&mut experiment, &message, now)
                    .await;
                persist_status(&api, &experiment).await?;
                return Ok(Action::await_change());
            }
        }
    }

    // Dispatch by target API kind.
    let driver = match select_driver(&experiment, &ctx.client) {
        Some(driver) => driver,
        None => {
            let api_version = experiment.spec.target_service.api_version.clone();
            ctx.recorder
                .mark_targets_error_with_reason(
                    &mut experiment,
                    "UnsupportedAPIVersion",
                    &api_version,
                    now,
                )
                .await;
            persist_status(&api, &experiment).await?;
            return Ok(Action::await_change());
        }
    };

    let requeue = sync_with_driver(
        &mut experiment,
        driver.as_ref(),
        ctx.analytics.as_ref(),
        &ctx.recorder,
        now,
    )
    .await;

    persist_status(&api, &experiment).await?;

    if let Some(metrics) = &ctx.metrics {
        metrics.record_reconciliation(driver.name(), start.elapsed().as_secs_f64());
        let split = experiment
            .status
            .as_ref()
            .map(|s| s.traffic_split)
            .unwrap_or_default();
        metrics.set_traffic_split(&namespace, &name, split.baseline, split.candidate);
    }

    Ok(match requeue {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

/// Attach, detect and iterate against one traffic driver.
///
/// All expected failures are encoded as conditions and converted to requeue
/// signals here; nothing bubbles out, which keeps the caller's persist
/// unconditional.
pub async fn sync_with_driver(
    experiment: &mut Experiment,
    driver: &dyn TrafficDriver,
    analytics: &dyn AnalyticsService,
    recorder: &ConditionRecorder,
    now: DateTime<Utc>,
) -> Option<Duration> {
    match driver.attach(experiment).await {
        Ok(()) => {
            if driver.name() == "istio" {
                recorder
                    .mark_routing_rules_ready(experiment, "", now)
                    .await;
            }
        }
        Err(DriverError::AlreadyControlled { owner }) => {
            let message = format!("target is already controlled by experiment {}", owner);
            recorder
                .mark_targets_error_with_reason(experiment, "AlreadyControlled", &message, now)
                .await;
            return None;
        }
        Err(DriverError::MissingTarget(message)) => {
            recorder.mark_targets_error(experiment, &message, now).await;
            return Some(TRANSIENT_REQUEUE);
        }
        Err(err) => {
            recorder
                .mark_routing_rules_error(experiment, &err.to_string(), now)
                .await;
            return Some(TRANSIENT_REQUEUE);
        }
    }

    let targets = match driver.detect(experiment).await {
        Ok(targets) => targets,
        Err(DriverError::MissingTarget(message)) => {
            recorder.mark_targets_error(experiment, &message, now).await;
            return Some(TRANSIENT_REQUEUE);
        }
        Err(err) => {
            recorder
                .mark_routing_rules_error(experiment, &err.to_string(), now)
                .await;
            return Some(TRANSIENT_REQUEUE);
        }
    };

    // No dangling traffic: a missing revision forces its side of the split
    // to zero and skips analytics entirely.
    if !targets.ready() {
        let message = if targets.baseline.is_none() {
            format!(
                "Missing Baseline Revision: {}",
                experiment.spec.target_service.baseline
            )
        } else {
            format!(
                "Missing Candidate Revision: {}",
                experiment.spec.target_service.candidate
            )
        };
        let split = targets.observed_split();
        if let Some(status) = experiment.status.as_mut() {
            status.traffic_split = split;
        }
        recorder.mark_targets_error(experiment, &message, now).await;
        return Some(TRANSIENT_REQUEUE);
    }

    recorder.mark_targets_found(experiment, now).await;

    let deps = IterationDeps {
        driver,
        analytics,
        recorder,
    };
    match run_iteration(experiment, &targets, &deps, now).await {
        Ok(requeue) => requeue,
        Err(err) => {
            recorder
                .mark_routing_rules_error(experiment, &err.to_string(), now)
                .await;
            Some(TRANSIENT_REQUEUE)
        }
    }
}

/// Timestamp bootstrap: epoch-zero lastIncrementTime, `{}` analysisState,
/// and a start timestamp plus dashboard link on first sight.
pub fn bootstrap_status(experiment: &mut Experiment, now: DateTime<Utc>) {
    {
        let status = experiment.status.get_or_insert_with(Default::default);
        if status.last_increment_time.is_none() {
            status.last_increment_time = Some(DateTime::<Utc>::UNIX_EPOCH.to_rfc3339());
        }
        if status.analysis_state.is_null() {
            status.analysis_state = json!({});
        }
        if !status.start_timestamp.is_empty() {
            return;
        }
        status.start_timestamp = epoch_millis(now);
    }
    let url = experiment.grafana_url();
    if let Some(status) = experiment.status.as_mut() {
        status.grafana_url = Some(url);
    }
}

async fn finalize(
    api: &Api<Experiment>,
    experiment: &mut Experiment,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    info!(experiment = %experiment.name_any(), "finalizing");

    if let Some(driver) = select_driver(experiment, &ctx.client) {
        match driver.finalize(experiment).await {
            Ok(()) => {}
            // Retry cluster I/O failures; the finalizer stays until rollback
            // succeeded.
            Err(DriverError::KubeError(err)) => return Err(err.into()),
            // Vanished targets leave nothing to roll back.
            Err(err) => {
                debug!(error = %err, "nothing to roll back during finalization");
            }
        }
    }

    remove_finalizer(api, experiment).await?;
    Ok(Action::await_change())
}

fn has_finalizer(experiment: &Experiment) -> bool {
    experiment.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer(api: &Api<Experiment>, experiment: &mut Experiment) {
    let mut finalizers = experiment.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    match api
        .patch(
            &experiment.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(updated) => {
            experiment.metadata.finalizers = updated.metadata.finalizers;
        }
        Err(err) => {
            warn!(error = %err, "setting finalizer failed (retrying)");
        }
    }
}

async fn remove_finalizer(
    api: &Api<Experiment>,
    experiment: &Experiment,
) -> Result<(), ReconcileError> {
    let finalizers: Vec<String> = experiment
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(
        &experiment.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    info!(experiment = %experiment.name_any(), "finalizer removed");
    Ok(())
}

/// Persist status through the status subresource.
///
/// A small retry loop absorbs transient failures; optimistic-concurrency
/// conflicts are benign because the next watch event carries the fresher
/// object.
pub async fn persist_status(
    api: &Api<Experiment>,
    experiment: &Experiment,
) -> Result<(), ReconcileError> {
    let name = experiment.name_any();
    let patch = json!({"status": experiment.status});
    let mut attempt = 0;
    loop {
        attempt += 1;
        match api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(experiment = %name, "status update conflict (benign)");
                return Ok(());
            }
            Err(err) if attempt < STATUS_UPDATE_ATTEMPTS => {
                warn!(error = %err, attempt, "status update failed, retrying");
                tokio::time::sleep(STATUS_RETRY_DELAY).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "reconcile_test.rs"]
mod tests;
