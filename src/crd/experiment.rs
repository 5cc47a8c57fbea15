use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Finalizer placed on every Experiment the controller has committed to
/// clean up on deletion.
pub const FINALIZER: &str = "finalizer.iter8-tools";

/// Ownership lock label written on the target routing object. At most one
/// Experiment may hold it for a given service.
pub const EXPERIMENT_LABEL: &str = "iter8-tools/experiment";

/// Role label on controller-synthesized routing rules.
pub const ROLE_LABEL: &str = "iter8-tools/role";

/// Host label on controller-synthesized routing rules.
pub const HOST_LABEL: &str = "iter8-tools/host";

/// Marks objects the controller created itself (as opposed to adopted).
pub const INIT_LABEL: &str = "iter8-tools/init";

pub const ROLE_STABLE: &str = "stable";
pub const ROLE_PROGRESSING: &str = "progressing";

/// targetService.apiVersion value selecting the mesh (Istio) traffic driver.
pub const KUBERNETES_SERVICE: &str = "v1";

/// targetService.apiVersion value selecting the serverless (Knative) driver.
pub const KNATIVE_SERVICE_V1ALPHA1: &str = "serving.knative.dev/v1alpha1";

const DEFAULT_MAX_ITERATIONS: i32 = 100;
const DEFAULT_STEP_SIZE: i32 = 2;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_ANALYTICS_ENDPOINT: &str = "http://iter8-analytics:5555";
const DEFAULT_GRAFANA_ENDPOINT: &str = "http://localhost:3000";

/// Experiment is a Custom Resource describing a progressive traffic-shifting
/// experiment between a baseline and a candidate revision of one service.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "iter8.tools",
    version = "v1alpha1",
    kind = "Experiment",
    namespaced,
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Iteration", "type":"integer", "jsonPath":".status.currentIteration"}"#,
    printcolumn = r#"{"name":"Baseline", "type":"integer", "jsonPath":".status.trafficSplit.baseline"}"#,
    printcolumn = r#"{"name":"Candidate", "type":"integer", "jsonPath":".status.trafficSplit.candidate"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExperimentSpec {
    /// The service under experiment and the two revisions competing for its
    /// traffic. `apiVersion` selects the traffic driver variant.
    #[serde(rename = "targetService")]
    pub target_service: TargetService,

    /// Iteration cadence and traffic-shaping strategy.
    #[serde(rename = "trafficControl", default)]
    pub traffic_control: TrafficControl,

    /// Analytics service wiring and success criteria.
    #[serde(default)]
    pub analysis: Analysis,

    /// Operator hook to terminate the experiment early with a verdict.
    /// The only spec field the controller ever reacts to after admission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<AssessmentOverride>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct TargetService {
    /// Selects the traffic driver: "v1" for mesh routing over plain
    /// Kubernetes services, "serving.knative.dev/v1alpha1" for Knative.
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,

    /// Name of the target service.
    #[serde(default)]
    pub name: String,

    /// Namespace of the target service; defaults to the Experiment's own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Current production revision.
    #[serde(default)]
    pub baseline: String,

    /// Revision under test.
    #[serde(default)]
    pub candidate: String,
}

/// Traffic-shaping strategy selecting the next candidate percentage.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Strategy {
    #[default]
    #[serde(rename = "check_and_increment")]
    CheckAndIncrement,
    #[serde(rename = "epsilon_greedy")]
    EpsilonGreedy,
    #[serde(rename = "increment_without_check")]
    IncrementWithoutCheck,
}

/// Where traffic ends up when the experiment succeeds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnSuccess {
    Baseline,
    #[default]
    Candidate,
    Both,
}

/// Early-termination override set by an operator.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AssessmentOverride {
    #[serde(rename = "override_success")]
    OverrideSuccess,
    #[serde(rename = "override_failure")]
    OverrideFailure,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct TrafficControl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,

    /// Number of timed iterations before the experiment terminates.
    #[serde(rename = "maxIterations", skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<i32>,

    /// Time between iterations, e.g. "30s" or "1m".
    #[serde(rename = "intervalDuration", skip_serializing_if = "Option::is_none")]
    pub interval_duration: Option<String>,

    /// Candidate percentage increment used when no analytics check runs.
    #[serde(rename = "stepSize", skip_serializing_if = "Option::is_none")]
    pub step_size: Option<i32>,

    #[serde(rename = "onSuccess", skip_serializing_if = "Option::is_none")]
    pub on_success: Option<OnSuccess>,
}

impl TrafficControl {
    pub fn strategy(&self) -> Strategy {
        self.strategy.unwrap_or_default()
    }

    pub fn max_iterations(&self) -> i32 {
        self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    /// Parsed iteration interval; unparsable or absent values fall back to
    /// the one-minute default (validation rejects bad values up front).
    pub fn interval(&self) -> Duration {
        self.interval_duration
            .as_deref()
            .and_then(crate::controller::experiment::parse_duration)
            .unwrap_or(DEFAULT_INTERVAL)
    }

    pub fn step_size(&self) -> i32 {
        self.step_size.unwrap_or(DEFAULT_STEP_SIZE)
    }

    pub fn on_success(&self) -> OnSuccess {
        self.on_success.unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct Analysis {
    /// Base URL of the analytics service.
    #[serde(rename = "serviceEndpoint", skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<String>,

    /// Base URL of the Grafana instance used for the dashboard link.
    #[serde(rename = "grafanaEndpoint", skip_serializing_if = "Option::is_none")]
    pub grafana_endpoint: Option<String>,

    /// Criteria the candidate must meet for the experiment to succeed.
    #[serde(rename = "successCriteria", default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<SuccessCriterion>,
}

impl Analysis {
    pub fn service_endpoint(&self) -> &str {
        self.service_endpoint
            .as_deref()
            .unwrap_or(DEFAULT_ANALYTICS_ENDPOINT)
    }

    pub fn grafana_endpoint(&self) -> &str {
        self.grafana_endpoint
            .as_deref()
            .unwrap_or(DEFAULT_GRAFANA_ENDPOINT)
    }
}

/// How a metric value is compared during assessment.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ToleranceType {
    /// Metric must stay below an absolute threshold.
    Threshold,
    /// Candidate must stay within a relative delta of the baseline.
    Delta,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct SuccessCriterion {
    /// Name of a metric defined in the iter8-metrics catalog.
    #[serde(rename = "metricName")]
    pub metric_name: String,

    #[serde(rename = "toleranceType")]
    pub tolerance_type: ToleranceType,

    pub tolerance: f64,

    /// Minimum sample count before the criterion is assessed.
    #[serde(rename = "sampleSize", skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<i32>,

    /// Abort the experiment as soon as this criterion fails.
    #[serde(rename = "stopOnFailure", skip_serializing_if = "Option::is_none")]
    pub stop_on_failure: Option<bool>,
}

/// Condition types carried independently because they fail and recover
/// independently; a single lifecycle enum cannot represent partial health.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ExperimentConditionType {
    TargetsProvided,
    MetricsSynced,
    AnalyticsServiceNormal,
    RoutingRulesReady,
    ExperimentCompleted,
}

impl ExperimentConditionType {
    /// Every condition type the controller maintains, in display order.
    pub const ALL: [ExperimentConditionType; 5] = [
        ExperimentConditionType::TargetsProvided,
        ExperimentConditionType::MetricsSynced,
        ExperimentConditionType::AnalyticsServiceNormal,
        ExperimentConditionType::RoutingRulesReady,
        ExperimentConditionType::ExperimentCompleted,
    ];
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ExperimentCondition {
    #[serde(rename = "type")]
    pub condition_type: ExperimentConditionType,

    pub status: ConditionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Baseline/candidate traffic percentages observed after the last apply.
/// The sum may be below 100 when other revisions still hold traffic.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct TrafficSplit {
    #[serde(default)]
    pub baseline: i32,
    #[serde(default)]
    pub candidate: i32,
}

/// Summary block of the last analytics assessment.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct AssessmentSummary {
    #[serde(rename = "allSuccessCriteriaMet", default)]
    pub all_success_criteria_met: bool,

    #[serde(rename = "abortExperiment", default)]
    pub abort_experiment: bool,
}

/// A metric resolved from the iter8-metrics catalog for this experiment.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentMetric {
    #[serde(rename = "isCounter", default)]
    pub is_counter: bool,

    #[serde(rename = "absentValue", default)]
    pub absent_value: String,

    #[serde(rename = "queryTemplate", default)]
    pub query_template: String,

    #[serde(rename = "sampleSizeTemplate", default)]
    pub sample_size_template: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ExperimentCondition>,

    /// Monotonically non-decreasing iteration counter.
    #[serde(rename = "currentIteration", default)]
    pub current_iteration: i32,

    /// Wall-clock timestamp (RFC3339) of the most recent iteration commit.
    #[serde(rename = "lastIncrementTime", skip_serializing_if = "Option::is_none")]
    pub last_increment_time: Option<String>,

    /// Experiment start, epoch milliseconds as a decimal string.
    #[serde(rename = "startTimestamp", default, skip_serializing_if = "String::is_empty")]
    pub start_timestamp: String,

    /// Experiment end, epoch milliseconds as a decimal string; empty until
    /// termination.
    #[serde(rename = "endTimestamp", default, skip_serializing_if = "String::is_empty")]
    pub end_timestamp: String,

    #[serde(rename = "trafficSplit", default)]
    pub traffic_split: TrafficSplit,

    #[serde(rename = "assessmentSummary", default)]
    pub assessment_summary: AssessmentSummary,

    /// Opaque state round-tripped to the analytics service between
    /// iterations. Bootstrapped to `{}`.
    #[serde(rename = "analysisState", default, skip_serializing_if = "Value::is_null")]
    pub analysis_state: Value,

    #[serde(rename = "grafanaURL", skip_serializing_if = "Option::is_none")]
    pub grafana_url: Option<String>,

    /// Metric definitions resolved from the catalog for the success criteria.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, ExperimentMetric>,
}

impl ExperimentStatus {
    /// Ensures every known condition type exists, defaulting to Unknown.
    /// Existing conditions are left untouched.
    pub fn init_conditions(&mut self, now: DateTime<Utc>) {
        for kind in ExperimentConditionType::ALL {
            if self.condition(kind).is_none() {
                self.conditions.push(ExperimentCondition {
                    condition_type: kind,
                    status: ConditionStatus::Unknown,
                    reason: None,
                    message: None,
                    last_transition_time: Some(now.to_rfc3339()),
                });
            }
        }
    }

    pub fn condition(&self, kind: ExperimentConditionType) -> Option<&ExperimentCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == kind)
    }

    /// Sets a condition, returning whether anything actually changed.
    /// Unchanged writes are no-ops and do not refresh lastTransitionTime,
    /// which keeps repeated reconciles byte-identical.
    pub fn set_condition(
        &mut self,
        kind: ExperimentConditionType,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == kind)
        {
            if existing.status == status
                && existing.reason.as_deref() == reason
                && existing.message.as_deref() == message
            {
                return false;
            }
            existing.status = status;
            existing.reason = reason.map(str::to_string);
            existing.message = message.map(str::to_string);
            existing.last_transition_time = Some(now.to_rfc3339());
            return true;
        }

        self.conditions.push(ExperimentCondition {
            condition_type: kind,
            status,
            reason: reason.map(str::to_string),
            message: message.map(str::to_string),
            last_transition_time: Some(now.to_rfc3339()),
        });
        true
    }

    pub fn mark_targets_found(&mut self, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::TargetsProvided,
            ConditionStatus::True,
            Some("TargetsFound"),
            None,
            now,
        )
    }

    pub fn mark_targets_error(
        &mut self,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.set_condition(
            ExperimentConditionType::TargetsProvided,
            ConditionStatus::False,
            Some(reason),
            Some(message),
            now,
        )
    }

    pub fn mark_metrics_synced(&mut self, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::MetricsSynced,
            ConditionStatus::True,
            Some("SyncMetricsSucceeded"),
            None,
            now,
        )
    }

    pub fn mark_metrics_sync_error(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::MetricsSynced,
            ConditionStatus::False,
            Some("SyncMetricsError"),
            Some(message),
            now,
        )
    }

    pub fn mark_analytics_running(&mut self, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::AnalyticsServiceNormal,
            ConditionStatus::True,
            Some("AnalyticsServiceRunning"),
            None,
            now,
        )
    }

    pub fn mark_analytics_error(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::AnalyticsServiceNormal,
            ConditionStatus::False,
            Some("AnalyticsServiceError"),
            Some(message),
            now,
        )
    }

    pub fn mark_routing_rules_ready(&mut self, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::RoutingRulesReady,
            ConditionStatus::True,
            Some("RoutingRulesReady"),
            None,
            now,
        )
    }

    pub fn mark_routing_rules_error(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::RoutingRulesReady,
            ConditionStatus::False,
            Some("RoutingRulesError"),
            Some(message),
            now,
        )
    }

    pub fn mark_experiment_progress(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::ExperimentCompleted,
            ConditionStatus::False,
            Some("ProgressUpdate"),
            Some(message),
            now,
        )
    }

    pub fn mark_experiment_succeeded(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::ExperimentCompleted,
            ConditionStatus::True,
            Some("ExperimentSucceeded"),
            Some(message),
            now,
        )
    }

    pub fn mark_experiment_failed(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::ExperimentCompleted,
            ConditionStatus::True,
            Some("ExperimentFailed"),
            Some(message),
            now,
        )
    }

    pub fn mark_experiment_aborted(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        self.set_condition(
            ExperimentConditionType::ExperimentCompleted,
            ConditionStatus::True,
            Some("Aborted"),
            Some(message),
            now,
        )
    }

    /// Completion is terminal: once this returns true the reconciler performs
    /// no further mutation except finalization.
    pub fn completed(&self) -> bool {
        self.condition(ExperimentConditionType::ExperimentCompleted)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    pub fn completed_reason(&self) -> Option<&str> {
        self.condition(ExperimentConditionType::ExperimentCompleted)
            .and_then(|c| c.reason.as_deref())
    }

    /// Parsed lastIncrementTime; epoch zero when unset or unparsable.
    pub fn last_increment(&self) -> DateTime<Utc> {
        self.last_increment_time
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Experiment {
    /// Namespace of the target service, defaulting to the Experiment's own.
    pub fn service_namespace(&self) -> String {
        self.spec
            .target_service
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| self.metadata.namespace.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Dashboard URL referencing the experiment's time window. The `to`
    /// parameter stays "now" until the experiment terminates.
    pub fn grafana_url(&self) -> String {
        let status = self.status.clone().unwrap_or_default();
        let end = if status.end_timestamp.is_empty() {
            "now"
        } else {
            status.end_timestamp.as_str()
        };
        format!(
            "{}/d/eXPEaNnZz/iter8-application-metrics?var-namespace={}&var-service={}&var-baseline={}&var-candidate={}&from={}&to={}",
            self.spec.analysis.grafana_endpoint(),
            self.service_namespace(),
            self.spec.target_service.name,
            self.spec.target_service.baseline,
            self.spec.target_service.candidate,
            status.start_timestamp,
            end,
        )
    }
}

/// Epoch milliseconds rendered as the decimal string used by
/// startTimestamp / endTimestamp.
pub fn epoch_millis(now: DateTime<Utc>) -> String {
    now.timestamp_millis().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "experiment_test.rs"]
mod tests;
