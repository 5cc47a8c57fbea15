//! Serverless traffic driver
//!
//! Steers traffic by mutating the percentages on a Knative Service's
//! `spec.traffic` list. The ownership lock is the `iter8-tools/experiment`
//! label on the service object; it is released on every terminal apply.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service as CoreService;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{BackendService, DriverError, TargetInfo, Targets, TrafficDriver};
use crate::crd::experiment::{Experiment, OnSuccess, TrafficSplit, EXPERIMENT_LABEL};
use crate::crd::knative::{Revision, Service as KnativeService, TrafficTarget};

pub struct KnativeDriver {
    client: Client,
}

impl KnativeDriver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn service_api(&self, experiment: &Experiment) -> Api<KnativeService> {
        Api::namespaced(self.client.clone(), &experiment.service_namespace())
    }

    async fn fetch_service(&self, experiment: &Experiment) -> Result<KnativeService, DriverError> {
        let name = &experiment.spec.target_service.name;
        self.service_api(experiment).get(name).await.map_err(|err| {
            if is_not_found(&err) {
                DriverError::MissingTarget(format!("Missing Service {}", name))
            } else {
                err.into()
            }
        })
    }

    async fn patch_traffic(
        &self,
        experiment: &Experiment,
        traffic: &[TrafficTarget],
        release_label: bool,
    ) -> Result<(), DriverError> {
        let mut patch = json!({"spec": {"traffic": traffic}});
        if release_label {
            patch["metadata"] = json!({"labels": {EXPERIMENT_LABEL: Value::Null}});
        }
        self.service_api(experiment)
            .patch(
                &experiment.spec.target_service.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn release_label(&self, experiment: &Experiment) -> Result<(), DriverError> {
        let patch = json!({"metadata": {"labels": {EXPERIMENT_LABEL: Value::Null}}});
        self.service_api(experiment)
            .patch(
                &experiment.spec.target_service.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    /// Terminal traffic commit shared by success and failure paths.
    async fn commit(
        &self,
        experiment: &Experiment,
        candidate_percent: i64,
    ) -> Result<TrafficSplit, DriverError> {
        let service = self.fetch_service(experiment).await?;
        let mut traffic = service.spec.traffic.clone();
        let changed = rebalance_traffic(
            &mut traffic,
            &experiment.spec.target_service.baseline,
            &experiment.spec.target_service.candidate,
            candidate_percent,
        );
        let has_label = service.labels().contains_key(EXPERIMENT_LABEL);
        if changed || has_label {
            self.patch_traffic(experiment, &traffic, true).await?;
        }
        Ok(observed_split(
            &traffic,
            &experiment.spec.target_service.baseline,
            &experiment.spec.target_service.candidate,
        ))
    }
}

#[async_trait]
impl TrafficDriver for KnativeDriver {
    fn name(&self) -> &'static str {
        "knative"
    }

    async fn attach(&self, experiment: &Experiment) -> Result<(), DriverError> {
        let service = self.fetch_service(experiment).await?;
        let name = experiment.name_any();

        match service.labels().get(EXPERIMENT_LABEL) {
            Some(owner) if owner != &name => {
                return Err(DriverError::AlreadyControlled {
                    owner: owner.clone(),
                });
            }
            Some(_) => return Ok(()),
            None => {}
        }

        let patch = json!({"metadata": {"labels": {EXPERIMENT_LABEL: name}}});
        self.service_api(experiment)
            .patch(
                &experiment.spec.target_service.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(
            service = %experiment.spec.target_service.name,
            "service attached to experiment"
        );
        Ok(())
    }

    async fn detect(&self, experiment: &Experiment) -> Result<Targets, DriverError> {
        let service = self.fetch_service(experiment).await?;
        let traffic = &service.spec.traffic;
        Ok(Targets {
            baseline: find_target(traffic, &experiment.spec.target_service.baseline),
            candidate: find_target(traffic, &experiment.spec.target_service.candidate),
        })
    }

    async fn resolve_backends(
        &self,
        experiment: &Experiment,
    ) -> Result<(BackendService, BackendService), DriverError> {
        let baseline = self
            .backend_for_revision(experiment, &experiment.spec.target_service.baseline)
            .await?;
        let candidate = self
            .backend_for_revision(experiment, &experiment.spec.target_service.candidate)
            .await?;
        Ok((baseline, candidate))
    }

    async fn apply(
        &self,
        experiment: &Experiment,
        candidate_percent: i32,
    ) -> Result<TrafficSplit, DriverError> {
        let service = self.fetch_service(experiment).await?;
        let mut traffic = service.spec.traffic.clone();
        let changed = rebalance_traffic(
            &mut traffic,
            &experiment.spec.target_service.baseline,
            &experiment.spec.target_service.candidate,
            candidate_percent as i64,
        );
        if changed {
            info!(
                service = %experiment.spec.target_service.name,
                candidate_percent,
                "updating traffic"
            );
            self.patch_traffic(experiment, &traffic, false).await?;
        }
        Ok(observed_split(
            &traffic,
            &experiment.spec.target_service.baseline,
            &experiment.spec.target_service.candidate,
        ))
    }

    async fn commit_success(
        &self,
        experiment: &Experiment,
        on_success: OnSuccess,
    ) -> Result<TrafficSplit, DriverError> {
        match on_success {
            OnSuccess::Baseline => self.commit(experiment, 0).await,
            OnSuccess::Candidate => self.commit(experiment, 100).await,
            OnSuccess::Both => {
                // Keep the last applied split; only the lock is released.
                let service = self.fetch_service(experiment).await?;
                if service.labels().contains_key(EXPERIMENT_LABEL) {
                    self.release_label(experiment).await?;
                }
                Ok(observed_split(
                    &service.spec.traffic,
                    &experiment.spec.target_service.baseline,
                    &experiment.spec.target_service.candidate,
                ))
            }
        }
    }

    async fn commit_failure(&self, experiment: &Experiment) -> Result<TrafficSplit, DriverError> {
        self.commit(experiment, 0).await
    }

    async fn finalize(&self, experiment: &Experiment) -> Result<(), DriverError> {
        let completed = experiment
            .status
            .as_ref()
            .map(|s| s.completed())
            .unwrap_or(false);
        if completed {
            return Ok(());
        }

        // Rollback; a vanished service means there is nothing left to clean.
        let service = match self.fetch_service(experiment).await {
            Ok(service) => service,
            Err(DriverError::MissingTarget(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut traffic = service.spec.traffic.clone();
        let baseline = &experiment.spec.target_service.baseline;
        let candidate = &experiment.spec.target_service.candidate;
        if find_target(&traffic, baseline).is_none() || find_target(&traffic, candidate).is_none() {
            return Ok(());
        }

        let changed = rebalance_traffic(&mut traffic, baseline, candidate, 0);
        let has_label = service.labels().contains_key(EXPERIMENT_LABEL);
        if changed || has_label {
            self.patch_traffic(experiment, &traffic, true).await?;
        }
        Ok(())
    }
}

impl KnativeDriver {
    async fn backend_for_revision(
        &self,
        experiment: &Experiment,
        revision_name: &str,
    ) -> Result<BackendService, DriverError> {
        let namespace = experiment.service_namespace();
        let revisions: Api<Revision> = Api::namespaced(self.client.clone(), &namespace);
        let revision = revisions.get(revision_name).await.map_err(|err| {
            DriverError::MissingBackend {
                revision: revision_name.to_string(),
                detail: err.to_string(),
            }
        })?;

        let service_name = revision
            .status
            .as_ref()
            .and_then(|s| s.service_name.clone())
            .ok_or_else(|| DriverError::MissingBackend {
                revision: revision_name.to_string(),
                detail: "revision reports no backing service".to_string(),
            })?;

        let services: Api<CoreService> = Api::namespaced(self.client.clone(), &namespace);
        services
            .get(&service_name)
            .await
            .map_err(|err| DriverError::MissingBackend {
                revision: revision_name.to_string(),
                detail: err.to_string(),
            })?;

        Ok(BackendService {
            name: service_name,
            namespace,
        })
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Finds the traffic entry routing to `revision`, as an observed target.
pub fn find_target(traffic: &[TrafficTarget], revision: &str) -> Option<TargetInfo> {
    traffic
        .iter()
        .find(|t| t.revision_name == revision)
        .map(|t| TargetInfo {
            revision: t.revision_name.clone(),
            percent: t.percent.unwrap_or(0) as i32,
        })
}

/// Sets the baseline entry to `100 - candidate_percent`, the candidate entry
/// to `candidate_percent`, and every other entry to zero. Returns whether
/// any entry changed.
pub fn rebalance_traffic(
    traffic: &mut [TrafficTarget],
    baseline: &str,
    candidate: &str,
    candidate_percent: i64,
) -> bool {
    let mut changed = false;
    for target in traffic.iter_mut() {
        let desired = if target.revision_name == baseline {
            100 - candidate_percent
        } else if target.revision_name == candidate {
            candidate_percent
        } else {
            0
        };
        if target.percent != Some(desired) {
            target.percent = Some(desired);
            changed = true;
        }
    }
    changed
}

fn observed_split(traffic: &[TrafficTarget], baseline: &str, candidate: &str) -> TrafficSplit {
    TrafficSplit {
        baseline: find_target(traffic, baseline)
            .map(|t| t.percent)
            .unwrap_or(0),
        candidate: find_target(traffic, candidate)
            .map(|t| t.percent)
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(revision: &str, percent: i64) -> TrafficTarget {
        TrafficTarget {
            revision_name: revision.to_string(),
            percent: Some(percent),
        }
    }

    #[test]
    fn rebalance_splits_between_baseline_and_candidate() {
        let mut traffic = vec![target("rev-1", 100), target("rev-2", 0)];
        let changed = rebalance_traffic(&mut traffic, "rev-1", "rev-2", 30);
        assert!(changed);
        assert_eq!(traffic[0].percent, Some(70));
        assert_eq!(traffic[1].percent, Some(30));
    }

    #[test]
    fn rebalance_zeroes_other_revisions() {
        let mut traffic = vec![target("rev-1", 50), target("rev-2", 20), target("rev-0", 30)];
        rebalance_traffic(&mut traffic, "rev-1", "rev-2", 40);
        assert_eq!(traffic[0].percent, Some(60));
        assert_eq!(traffic[1].percent, Some(40));
        assert_eq!(traffic[2].percent, Some(0));
    }

    #[test]
    fn rebalance_is_idempotent() {
        let mut traffic = vec![target("rev-1", 60), target("rev-2", 40)];
        assert!(!rebalance_traffic(&mut traffic, "rev-1", "rev-2", 40));
    }

    #[test]
    fn find_target_defaults_missing_percent_to_zero() {
        let traffic = vec![TrafficTarget {
            revision_name: "rev-1".to_string(),
            percent: None,
        }];
        let found = find_target(&traffic, "rev-1").unwrap();
        assert_eq!(found.percent, 0);
        assert!(find_target(&traffic, "rev-2").is_none());
    }

    #[test]
    fn observed_split_reads_both_entries() {
        let traffic = vec![target("rev-1", 80), target("rev-2", 20)];
        let split = observed_split(&traffic, "rev-1", "rev-2");
        assert_eq!(split.baseline, 80);
        assert_eq!(split.candidate, 20);
    }
}
