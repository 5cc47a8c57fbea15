//! Analytics service integration
//!
//! The analytics service is an external HTTP collaborator: the controller
//! POSTs the experiment state once per iteration and receives a recommended
//! traffic split plus a statistical assessment back. Each strategy has its
//! own endpoint path.
//!
//! Follows the trait-based pattern used elsewhere in the controller:
//! - `AnalyticsService` trait for abstraction
//! - `HttpAnalyticsClient` for production
//! - `MockAnalyticsClient` for testing

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crd::experiment::{
    AssessmentSummary, Experiment, ExperimentMetric, Strategy, SuccessCriterion,
};
use crate::controller::drivers::BackendService;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("analytics service unreachable: {0}")]
    Unreachable(String),

    #[error("analytics call timed out after {0:?}")]
    Timeout(Duration),

    #[error("analytics service returned HTTP {status}: {body}")]
    ServiceError { status: u16, body: String },

    #[error("analytics service returned invalid response: {0}")]
    InvalidResponse(String),

    #[error("strategy {0:?} performs no analytics calls")]
    UnsupportedStrategy(Strategy),
}

/// Endpoint path for a strategy, or None for strategies that never consult
/// the analytics service.
pub fn strategy_path(strategy: Strategy) -> Option<&'static str> {
    match strategy {
        Strategy::CheckAndIncrement => Some("/api/v1/analytics/canary/check_and_increment"),
        Strategy::EpsilonGreedy => Some("/api/v1/analytics/canary/epsilon_t_greedy"),
        Strategy::IncrementWithoutCheck => None,
    }
}

/// One revision's identity as the analytics service sees it.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct VersionDetail {
    #[serde(rename = "serviceName")]
    pub service_name: String,

    pub namespace: String,

    #[serde(rename = "revisionName")]
    pub revision_name: String,
}

/// Request body POSTed to the strategy endpoint.
#[derive(Serialize, Clone, Debug)]
pub struct AnalyticsRequest {
    /// Name of the target service under experiment.
    pub experiment: String,

    pub baseline: VersionDetail,
    pub candidate: VersionDetail,

    /// Resolved metric definitions for the success criteria.
    pub metrics: BTreeMap<String, ExperimentMetric>,

    /// Opaque state returned by the previous analytics response.
    #[serde(rename = "analysisState")]
    pub analysis_state: Value,

    #[serde(rename = "successCriteria")]
    pub success_criteria: Vec<SuccessCriterion>,

    /// Experiment start, epoch milliseconds as a decimal string.
    #[serde(rename = "startTime")]
    pub start_time: String,

    /// Current wall clock, epoch milliseconds as a decimal string.
    #[serde(rename = "endTime")]
    pub end_time: String,
}

impl AnalyticsRequest {
    /// Assembles the payload from the experiment's current state and the
    /// backend services resolved by the traffic driver.
    pub fn build(
        experiment: &Experiment,
        baseline: BackendService,
        candidate: BackendService,
        end_time: String,
    ) -> Self {
        let status = experiment.status.clone().unwrap_or_default();
        AnalyticsRequest {
            experiment: experiment.spec.target_service.name.clone(),
            baseline: VersionDetail {
                service_name: baseline.name,
                namespace: baseline.namespace,
                revision_name: experiment.spec.target_service.baseline.clone(),
            },
            candidate: VersionDetail {
                service_name: candidate.name,
                namespace: candidate.namespace,
                revision_name: experiment.spec.target_service.candidate.clone(),
            },
            metrics: status.metrics,
            analysis_state: status.analysis_state,
            success_criteria: experiment.spec.analysis.success_criteria.clone(),
            start_time: status.start_timestamp,
            end_time,
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficRecommendation {
    #[serde(rename = "trafficPercentage", default)]
    pub traffic_percentage: i32,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnalyticsAssessment {
    #[serde(default)]
    pub summary: AssessmentSummary,
}

/// Response body returned by either strategy endpoint.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct AnalyticsResponse {
    #[serde(default)]
    pub baseline: TrafficRecommendation,

    #[serde(default)]
    pub candidate: TrafficRecommendation,

    #[serde(default)]
    pub assessment: AnalyticsAssessment,

    /// Opaque state to round-trip into the next request.
    #[serde(rename = "lastState", default)]
    pub last_state: Option<Value>,
}

/// Trait for consulting the analytics service
///
/// Production code uses `HttpAnalyticsClient`; tests use
/// `MockAnalyticsClient` with a preloaded response queue.
#[async_trait]
pub trait AnalyticsService: Send + Sync {
    async fn analyze(
        &self,
        endpoint: &str,
        strategy: Strategy,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsResponse, AnalyticsError>;

    /// Downcast support for testing
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Production client POSTing JSON to the configured endpoint.
pub struct HttpAnalyticsClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpAnalyticsClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build analytics HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self { client, timeout }
    }
}

impl Default for HttpAnalyticsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyticsService for HttpAnalyticsClient {
    async fn analyze(
        &self,
        endpoint: &str,
        strategy: Strategy,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsResponse, AnalyticsError> {
        let path =
            strategy_path(strategy).ok_or(AnalyticsError::UnsupportedStrategy(strategy))?;
        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalyticsError::Timeout(self.timeout)
                } else {
                    AnalyticsError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyticsError::ServiceError {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| AnalyticsError::InvalidResponse(e.to_string()))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Mock analytics client for testing
///
/// Returns queued responses in order and records every request it receives.
#[cfg(test)]
pub struct MockAnalyticsClient {
    queue: std::sync::Mutex<std::collections::VecDeque<Result<AnalyticsResponse, AnalyticsError>>>,
    requests: std::sync::Mutex<Vec<AnalyticsRequest>>,
}

#[cfg(test)]
impl Default for MockAnalyticsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockAnalyticsClient {
    pub fn new() -> Self {
        Self {
            queue: std::sync::Mutex::new(std::collections::VecDeque::new()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn enqueue(&self, response: AnalyticsResponse) {
        self.queue.lock().unwrap().push_back(Ok(response));
    }

    pub fn enqueue_error(&self, error: AnalyticsError) {
        self.queue.lock().unwrap().push_back(Err(error));
    }

    /// Convenience: a response recommending `candidate_percent` with the
    /// given summary flags.
    pub fn recommendation(
        candidate_percent: i32,
        all_success_criteria_met: bool,
        abort_experiment: bool,
    ) -> AnalyticsResponse {
        AnalyticsResponse {
            baseline: TrafficRecommendation {
                traffic_percentage: 100 - candidate_percent,
            },
            candidate: TrafficRecommendation {
                traffic_percentage: candidate_percent,
            },
            assessment: AnalyticsAssessment {
                summary: AssessmentSummary {
                    all_success_criteria_met,
                    abort_experiment,
                },
            },
            last_state: Some(serde_json::json!({"mock": true})),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<AnalyticsRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl AnalyticsService for MockAnalyticsClient {
    async fn analyze(
        &self,
        _endpoint: &str,
        _strategy: Strategy,
        request: &AnalyticsRequest,
    ) -> Result<AnalyticsResponse, AnalyticsError> {
        self.requests.lock().unwrap().push(request.clone());
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AnalyticsError::Unreachable("no response queued".into())))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "analytics_test.rs"]
mod tests;
