//! Shared iteration engine
//!
//! One invocation covers a single pass of the experiment state machine:
//! termination check first, then the progress gate, then the analytics
//! branch, then apply-and-advance. Both traffic drivers share this logic;
//! all terminal transitions route through the driver so the split-integrity
//! rule (baseline + candidate = 100 on commit, other revisions zeroed)
//! holds regardless of substrate.
//!
//! The iteration counter only advances after a successful apply, giving
//! at-most-one traffic commit per iteration interval across retries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use crate::controller::analytics::{AnalyticsRequest, AnalyticsService};
use crate::controller::drivers::{DriverError, Targets, TrafficDriver};
use crate::controller::recorder::ConditionRecorder;
use crate::crd::experiment::{epoch_millis, AssessmentOverride, Experiment, Strategy};

/// Requeue delay after a transient failure (analytics or missing backends).
pub const TRANSIENT_REQUEUE: Duration = Duration::from_secs(5);

/// Collaborators the iteration engine drives. Split out so tests can swap
/// every side effect for an in-memory double.
pub struct IterationDeps<'a> {
    pub driver: &'a dyn TrafficDriver,
    pub analytics: &'a dyn AnalyticsService,
    pub recorder: &'a ConditionRecorder,
}

/// The strategy actually in effect: a checked strategy without success
/// criteria degenerates to increment-without-check.
pub fn effective_strategy(experiment: &Experiment) -> Strategy {
    let strategy = experiment.spec.traffic_control.strategy();
    if strategy != Strategy::IncrementWithoutCheck
        && experiment.spec.analysis.success_criteria.is_empty()
    {
        return Strategy::IncrementWithoutCheck;
    }
    strategy
}

/// Success predicate evaluated at termination.
pub fn experiment_succeeded(experiment: &Experiment) -> bool {
    let criteria_met = experiment
        .status
        .as_ref()
        .map(|s| s.assessment_summary.all_success_criteria_met)
        .unwrap_or(false);

    if effective_strategy(experiment) == Strategy::IncrementWithoutCheck {
        return matches!(
            experiment.spec.assessment,
            Some(AssessmentOverride::OverrideSuccess) | None
        );
    }

    match experiment.spec.assessment {
        Some(AssessmentOverride::OverrideSuccess) => true,
        Some(AssessmentOverride::OverrideFailure) => false,
        None => criteria_met,
    }
}

fn success_message(experiment: &Experiment) -> &'static str {
    if experiment.spec.assessment == Some(AssessmentOverride::OverrideSuccess) {
        "OverrideSuccess"
    } else if experiment
        .status
        .as_ref()
        .map(|s| s.assessment_summary.all_success_criteria_met)
        .unwrap_or(false)
    {
        "AllSuccessCriteriaMet"
    } else {
        "IterationsExhausted"
    }
}

fn failure_message(experiment: &Experiment) -> &'static str {
    if experiment.spec.assessment == Some(AssessmentOverride::OverrideFailure) {
        "OverrideFailure"
    } else if !experiment
        .status
        .as_ref()
        .map(|s| s.assessment_summary.all_success_criteria_met)
        .unwrap_or(false)
    {
        "NotAllSuccessCriteriaMet"
    } else {
        "UnexpectedCondition"
    }
}

/// Runs one pass of the iteration state machine.
///
/// Returns the requeue delay the caller should schedule, or None for
/// terminal states. Driver I/O failures propagate without advancing the
/// iteration counter; the reconciler turns them into a routing-rules error
/// condition plus a short requeue.
pub async fn run_iteration(
    experiment: &mut Experiment,
    targets: &Targets,
    deps: &IterationDeps<'_>,
    now: DateTime<Utc>,
) -> Result<Option<Duration>, DriverError> {
    let traffic = experiment.spec.traffic_control.clone();
    let current_iteration = experiment
        .status
        .as_ref()
        .map(|s| s.current_iteration)
        .unwrap_or(0);

    // Termination check comes first so operator overrides and exhausted
    // iteration budgets take effect even while an interval is pending.
    if current_iteration >= traffic.max_iterations() || experiment.spec.assessment.is_some() {
        if experiment_succeeded(experiment) {
            let split = deps
                .driver
                .commit_success(experiment, traffic.on_success())
                .await?;
            if let Some(status) = experiment.status.as_mut() {
                status.traffic_split = split;
            }
            let message = success_message(experiment);
            deps.recorder
                .mark_experiment_succeeded(experiment, message, now)
                .await;
        } else {
            let split = deps.driver.commit_failure(experiment).await?;
            if let Some(status) = experiment.status.as_mut() {
                status.traffic_split = split;
            }
            let message = failure_message(experiment);
            deps.recorder
                .mark_experiment_failed(experiment, message, now)
                .await;
        }
        return Ok(None);
    }

    // Progress gate: inside the interval nothing moves, the status just
    // reflects what the driver observed.
    let interval = traffic.interval();
    let chrono_interval =
        chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::seconds(60));
    let next_due = experiment
        .status
        .clone()
        .unwrap_or_default()
        .last_increment()
        + chrono_interval;
    if now < next_due {
        if let Some(status) = experiment.status.as_mut() {
            status.traffic_split = targets.observed_split();
        }
        let message = format!("Iteration {} Completed", current_iteration);
        deps.recorder
            .mark_experiment_progress(experiment, false, &message, now)
            .await;
        let remaining = (next_due - now).to_std().unwrap_or(interval);
        return Ok(Some(remaining));
    }

    info!(iteration = current_iteration, "processing iteration");

    let current_percent = targets
        .candidate
        .as_ref()
        .map(|t| t.percent)
        .unwrap_or(0);

    let next_percent = if effective_strategy(experiment) == Strategy::IncrementWithoutCheck {
        (current_percent + traffic.step_size()).clamp(0, 100)
    } else {
        let (baseline_backend, candidate_backend) =
            match deps.driver.resolve_backends(experiment).await {
                Ok(backends) => backends,
                Err(
                    err @ (DriverError::MissingBackend { .. } | DriverError::MissingTarget(_)),
                ) => {
                    let message = format!("Missing Core Service: {}", err);
                    deps.recorder
                        .mark_targets_error(experiment, &message, now)
                        .await;
                    return Ok(Some(TRANSIENT_REQUEUE));
                }
                Err(err) => return Err(err),
            };

        let request = AnalyticsRequest::build(
            experiment,
            baseline_backend,
            candidate_backend,
            epoch_millis(now),
        );
        let endpoint = experiment.spec.analysis.service_endpoint().to_string();
        let strategy = effective_strategy(experiment);

        match deps.analytics.analyze(&endpoint, strategy, &request).await {
            Err(err) => {
                deps.recorder
                    .mark_analytics_error(experiment, &err.to_string(), now)
                    .await;
                return Ok(Some(TRANSIENT_REQUEUE));
            }
            Ok(response) => {
                if response.assessment.summary.abort_experiment {
                    let split = deps.driver.commit_failure(experiment).await?;
                    if let Some(status) = experiment.status.as_mut() {
                        status.traffic_split = split;
                        status.assessment_summary = response.assessment.summary;
                    }
                    deps.recorder
                        .mark_experiment_aborted(
                            experiment,
                            "Aborted, Traffic: AllToBaseline.",
                            now,
                        )
                        .await;
                    return Ok(None);
                }

                if let Some(status) = experiment.status.as_mut() {
                    status.analysis_state =
                        response.last_state.clone().unwrap_or_else(|| json!({}));
                    status.assessment_summary = response.assessment.summary;
                }
                deps.recorder.mark_analytics_running(experiment, now).await;
                response.candidate.traffic_percentage.clamp(0, 100)
            }
        }
    };

    // Apply and advance. A failed apply propagates before the counter
    // moves, so the iteration is retried rather than skipped.
    let split = deps.driver.apply(experiment, next_percent).await?;
    if let Some(status) = experiment.status.as_mut() {
        status.current_iteration += 1;
        status.last_increment_time = Some(now.to_rfc3339());
        status.traffic_split = split;
    }
    let message = format!(
        "New Traffic, baseline: {}, candidate: {}",
        split.baseline, split.candidate
    );
    deps.recorder
        .mark_experiment_progress(experiment, true, &message, now)
        .await;

    Ok(Some(interval))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "iteration_test.rs"]
mod tests;
