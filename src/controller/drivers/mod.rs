//! Traffic drivers
//!
//! A driver translates a desired baseline/candidate split into mutations of
//! one routing substrate. Two variants exist behind the common
//! `TrafficDriver` trait: Knative serverless services (traffic percentages
//! on the service object) and Istio mesh routing (a VirtualService +
//! DestinationRule pair). The reconciler resolves the variant once per
//! reconcile from `spec.targetService.apiVersion`.

pub mod istio;
pub mod knative;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::experiment::{
    Experiment, OnSuccess, TrafficSplit, KNATIVE_SERVICE_V1ALPHA1, KUBERNETES_SERVICE,
};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{0}")]
    MissingTarget(String),

    #[error("target is already controlled by experiment {owner}")]
    AlreadyControlled { owner: String },

    #[error("missing backend service for revision {revision}: {detail}")]
    MissingBackend { revision: String, detail: String },
}

/// Observed routing entry for one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub revision: String,
    pub percent: i32,
}

/// What the driver observed for the experiment's two revisions. A missing
/// side means the named revision holds no routing entry (or does not exist).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets {
    pub baseline: Option<TargetInfo>,
    pub candidate: Option<TargetInfo>,
}

impl Targets {
    pub fn ready(&self) -> bool {
        self.baseline.is_some() && self.candidate.is_some()
    }

    /// Observed split with missing sides forced to zero, mirroring the
    /// no-dangling-traffic rule.
    pub fn observed_split(&self) -> TrafficSplit {
        TrafficSplit {
            baseline: self.baseline.as_ref().map(|t| t.percent).unwrap_or(0),
            candidate: self.candidate.as_ref().map(|t| t.percent).unwrap_or(0),
        }
    }
}

/// A core service backing one revision, as named in the analytics payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendService {
    pub name: String,
    pub namespace: String,
}

/// Substrate-specific adapter translating desired splits into
/// routing-record mutations.
///
/// Implementations must be idempotent: applying an already-current split is
/// a no-op on the cluster.
#[async_trait]
pub trait TrafficDriver: Send + Sync {
    /// Driver name for logging and condition attribution.
    fn name(&self) -> &'static str;

    /// Takes (or verifies) the ownership lock on the target routing object.
    /// Fails with `AlreadyControlled` when another experiment holds it; no
    /// routing mutation happens in that case.
    async fn attach(&self, experiment: &Experiment) -> Result<(), DriverError>;

    /// Observes the current baseline/candidate routing entries.
    async fn detect(&self, experiment: &Experiment) -> Result<Targets, DriverError>;

    /// Resolves the backend core services feeding the analytics payload.
    /// Only called right before an analytics request.
    async fn resolve_backends(
        &self,
        experiment: &Experiment,
    ) -> Result<(BackendService, BackendService), DriverError>;

    /// Routes `candidate_percent` to the candidate, the remainder to the
    /// baseline, and zero everywhere else. Returns the split now in effect.
    async fn apply(
        &self,
        experiment: &Experiment,
        candidate_percent: i32,
    ) -> Result<TrafficSplit, DriverError>;

    /// Commits terminal traffic according to `onSuccess` and releases the
    /// ownership lock. `both` preserves the last applied split.
    async fn commit_success(
        &self,
        experiment: &Experiment,
        on_success: OnSuccess,
    ) -> Result<TrafficSplit, DriverError>;

    /// Reverts all traffic to the baseline and releases the ownership lock.
    async fn commit_failure(&self, experiment: &Experiment) -> Result<TrafficSplit, DriverError>;

    /// Deletion-time cleanup: rolls traffic back to the baseline unless the
    /// experiment already completed, then releases everything the
    /// controller holds on the substrate.
    async fn finalize(&self, experiment: &Experiment) -> Result<(), DriverError>;
}

/// Resolve the driver variant from the target service's apiVersion.
///
/// Returns None for unsupported apiVersions; the reconciler records
/// `TargetsProvided=False` reason `UnsupportedAPIVersion` in that case.
pub fn select_driver(
    experiment: &Experiment,
    client: &kube::Client,
) -> Option<Box<dyn TrafficDriver>> {
    match experiment.spec.target_service.api_version.as_str() {
        KUBERNETES_SERVICE => Some(Box::new(istio::IstioDriver::new(client.clone()))),
        KNATIVE_SERVICE_V1ALPHA1 => Some(Box::new(knative::KnativeDriver::new(client.clone()))),
        _ => None,
    }
}
