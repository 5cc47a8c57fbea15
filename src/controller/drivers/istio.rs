//! Mesh traffic driver
//!
//! Steers traffic through an Istio VirtualService / DestinationRule pair
//! synthesized by the controller. The DestinationRule declares `baseline`
//! and `candidate` subsets keyed by the two deployments' selector labels;
//! the VirtualService routes the target host to those subsets with weights
//! summing to 100. The pair carries the `iter8-tools/role`,
//! `iter8-tools/host` and `iter8-tools/init` labels plus the ownership
//! lock; on a terminal commit the pair is demoted to role `stable` and the
//! lock released, so the winning split stays pinned after the experiment.
//! Finalizing an unfinished experiment re-pins 100% baseline the same way;
//! the pair itself is never deleted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service as CoreService;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{json, Value};
use tracing::info;

use super::{BackendService, DriverError, TargetInfo, Targets, TrafficDriver};
use crate::crd::experiment::{
    Experiment, OnSuccess, TrafficSplit, EXPERIMENT_LABEL, HOST_LABEL, INIT_LABEL, ROLE_LABEL,
    ROLE_PROGRESSING, ROLE_STABLE,
};
use crate::crd::istio::{
    Destination, DestinationRule, DestinationRuleSpec, HttpRoute, HttpRouteDestination, Subset,
    VirtualService, VirtualServiceSpec,
};

pub const SUBSET_BASELINE: &str = "baseline";
pub const SUBSET_CANDIDATE: &str = "candidate";

/// Shared name of the synthesized VirtualService / DestinationRule pair.
pub fn routing_rule_name(service: &str) -> String {
    format!("{}.iter8-experiment", service)
}

pub struct IstioDriver {
    client: Client,
}

impl IstioDriver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn virtual_services(&self, experiment: &Experiment) -> Api<VirtualService> {
        Api::namespaced(self.client.clone(), &experiment.service_namespace())
    }

    fn destination_rules(&self, experiment: &Experiment) -> Api<DestinationRule> {
        Api::namespaced(self.client.clone(), &experiment.service_namespace())
    }

    fn deployments(&self, experiment: &Experiment) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &experiment.service_namespace())
    }

    async fn fetch_rules(&self, experiment: &Experiment) -> Result<VirtualService, DriverError> {
        let name = routing_rule_name(&experiment.spec.target_service.name);
        self.virtual_services(experiment)
            .get(&name)
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    DriverError::MissingTarget(format!("Missing routing rules {}", name))
                } else {
                    err.into()
                }
            })
    }

    async fn deployment_selector(
        &self,
        experiment: &Experiment,
        name: &str,
    ) -> Result<BTreeMap<String, String>, DriverError> {
        let deployment = self
            .deployments(experiment)
            .get(name)
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    DriverError::MissingTarget(format!("Missing Deployment {}", name))
                } else {
                    err.into()
                }
            })?;
        Ok(deployment
            .spec
            .and_then(|s| s.selector.match_labels)
            .unwrap_or_default())
    }

    /// Creates the VirtualService / DestinationRule pair for this
    /// experiment. Concurrent creation races are benign.
    async fn create_rules(&self, experiment: &Experiment) -> Result<(), DriverError> {
        let baseline_labels = self
            .deployment_selector(experiment, &experiment.spec.target_service.baseline)
            .await?;
        let candidate_labels = self
            .deployment_selector(experiment, &experiment.spec.target_service.candidate)
            .await?;

        let dr = build_destination_rule(experiment, baseline_labels, candidate_labels);
        let vs = build_virtual_service(experiment);

        match self
            .destination_rules(experiment)
            .create(&PostParams::default(), &dr)
            .await
        {
            Ok(_) => {}
            Err(err) if is_already_exists(&err) => {}
            Err(err) => return Err(err.into()),
        }
        match self
            .virtual_services(experiment)
            .create(&PostParams::default(), &vs)
            .await
        {
            Ok(_) => {}
            Err(err) if is_already_exists(&err) => {}
            Err(err) => return Err(err.into()),
        }
        info!(
            host = %experiment.spec.target_service.name,
            "routing rules created"
        );
        Ok(())
    }

    async fn patch_routes(
        &self,
        experiment: &Experiment,
        http: &[HttpRoute],
    ) -> Result<(), DriverError> {
        let name = routing_rule_name(&experiment.spec.target_service.name);
        let patch = json!({"spec": {"http": http}});
        self.virtual_services(experiment)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Demotes the pair to role `stable` and releases the ownership lock.
    async fn demote_to_stable(&self, experiment: &Experiment) -> Result<(), DriverError> {
        let name = routing_rule_name(&experiment.spec.target_service.name);
        let patch = json!({"metadata": {"labels": {
            ROLE_LABEL: ROLE_STABLE,
            EXPERIMENT_LABEL: Value::Null,
            INIT_LABEL: Value::Null,
        }}});
        self.virtual_services(experiment)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        self.destination_rules(experiment)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn commit(
        &self,
        experiment: &Experiment,
        candidate_percent: Option<i32>,
    ) -> Result<TrafficSplit, DriverError> {
        let mut vs = self.fetch_rules(experiment).await?;
        if let Some(percent) = candidate_percent {
            if reweight_routes(&mut vs, percent) {
                self.patch_routes(experiment, &vs.spec.http).await?;
            }
        }
        self.demote_to_stable(experiment).await?;
        Ok(route_weights(&vs))
    }
}

#[async_trait]
impl TrafficDriver for IstioDriver {
    fn name(&self) -> &'static str {
        "istio"
    }

    async fn attach(&self, experiment: &Experiment) -> Result<(), DriverError> {
        let host = &experiment.spec.target_service.name;
        let name = experiment.name_any();

        // The host lock spans every rule labeled for this host, not just the
        // pair this experiment would create.
        let selector = format!("{}={}", HOST_LABEL, host);
        let existing = self
            .virtual_services(experiment)
            .list(&ListParams::default().labels(&selector))
            .await?;
        for vs in &existing.items {
            if let Some(owner) = vs.labels().get(EXPERIMENT_LABEL) {
                if owner != &name {
                    return Err(DriverError::AlreadyControlled {
                        owner: owner.clone(),
                    });
                }
            }
        }

        let rule_name = routing_rule_name(host);
        if let Some(vs) = existing.items.iter().find(|vs| vs.name_any() == rule_name) {
            // A demoted pair from an earlier experiment can be adopted; it
            // carries the host label but no ownership lock.
            if !vs.labels().contains_key(EXPERIMENT_LABEL) {
                let patch = json!({"metadata": {"labels": {
                    EXPERIMENT_LABEL: name,
                    ROLE_LABEL: ROLE_PROGRESSING,
                }}});
                self.virtual_services(experiment)
                    .patch(&rule_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                self.destination_rules(experiment)
                    .patch(&rule_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
            }
            return Ok(());
        }

        self.create_rules(experiment).await
    }

    async fn detect(&self, experiment: &Experiment) -> Result<Targets, DriverError> {
        let vs = self.fetch_rules(experiment).await?;
        let split = route_weights(&vs);

        let baseline = match self
            .deployments(experiment)
            .get(&experiment.spec.target_service.baseline)
            .await
        {
            Ok(_) => Some(TargetInfo {
                revision: experiment.spec.target_service.baseline.clone(),
                percent: split.baseline,
            }),
            Err(err) if is_not_found(&err) => None,
            Err(err) => return Err(err.into()),
        };
        let candidate = match self
            .deployments(experiment)
            .get(&experiment.spec.target_service.candidate)
            .await
        {
            Ok(_) => Some(TargetInfo {
                revision: experiment.spec.target_service.candidate.clone(),
                percent: split.candidate,
            }),
            Err(err) if is_not_found(&err) => None,
            Err(err) => return Err(err.into()),
        };

        Ok(Targets {
            baseline,
            candidate,
        })
    }

    async fn resolve_backends(
        &self,
        experiment: &Experiment,
    ) -> Result<(BackendService, BackendService), DriverError> {
        let namespace = experiment.service_namespace();
        let name = &experiment.spec.target_service.name;
        let services: Api<CoreService> = Api::namespaced(self.client.clone(), &namespace);
        services
            .get(name)
            .await
            .map_err(|err| DriverError::MissingBackend {
                revision: name.clone(),
                detail: err.to_string(),
            })?;

        // Both revisions sit behind the same mesh host; the subsets
        // distinguish them in the routing rules and the payload tags.
        let backend = BackendService {
            name: name.clone(),
            namespace,
        };
        Ok((backend.clone(), backend))
    }

    async fn apply(
        &self,
        experiment: &Experiment,
        candidate_percent: i32,
    ) -> Result<TrafficSplit, DriverError> {
        let mut vs = self.fetch_rules(experiment).await?;
        if reweight_routes(&mut vs, candidate_percent) {
            info!(
                host = %experiment.spec.target_service.name,
                candidate_percent,
                "updating route weights"
            );
            self.patch_routes(experiment, &vs.spec.http).await?;
        }
        Ok(route_weights(&vs))
    }

    async fn commit_success(
        &self,
        experiment: &Experiment,
        on_success: OnSuccess,
    ) -> Result<TrafficSplit, DriverError> {
        match on_success {
            OnSuccess::Baseline => self.commit(experiment, Some(0)).await,
            OnSuccess::Candidate => self.commit(experiment, Some(100)).await,
            OnSuccess::Both => self.commit(experiment, None).await,
        }
    }

    async fn commit_failure(&self, experiment: &Experiment) -> Result<TrafficSplit, DriverError> {
        self.commit(experiment, Some(0)).await
    }

    async fn finalize(&self, experiment: &Experiment) -> Result<(), DriverError> {
        let completed = experiment
            .status
            .as_ref()
            .map(|s| s.completed())
            .unwrap_or(false);
        if completed {
            // Terminal commits already demoted the rules and released the
            // lock.
            return Ok(());
        }

        // Rollback: the pair stays in place pinned to the baseline, since
        // removing it would hand routing back to the mesh defaults rather
        // than to the baseline revision.
        let mut vs = match self.fetch_rules(experiment).await {
            Ok(vs) => vs,
            Err(DriverError::MissingTarget(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        if reweight_routes(&mut vs, 0) {
            self.patch_routes(experiment, &vs.spec.http).await?;
        }
        self.demote_to_stable(experiment).await
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn rule_labels(experiment: &Experiment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            EXPERIMENT_LABEL.to_string(),
            experiment.name_any(),
        ),
        (ROLE_LABEL.to_string(), ROLE_PROGRESSING.to_string()),
        (
            HOST_LABEL.to_string(),
            experiment.spec.target_service.name.clone(),
        ),
        (INIT_LABEL.to_string(), "true".to_string()),
    ])
}

/// DestinationRule declaring the baseline/candidate subsets, keyed by the
/// two deployments' selector labels.
pub fn build_destination_rule(
    experiment: &Experiment,
    baseline_labels: BTreeMap<String, String>,
    candidate_labels: BTreeMap<String, String>,
) -> DestinationRule {
    let host = &experiment.spec.target_service.name;
    let mut dr = DestinationRule::new(
        &routing_rule_name(host),
        DestinationRuleSpec {
            host: host.clone(),
            subsets: vec![
                Subset {
                    name: SUBSET_BASELINE.to_string(),
                    labels: baseline_labels,
                },
                Subset {
                    name: SUBSET_CANDIDATE.to_string(),
                    labels: candidate_labels,
                },
            ],
        },
    );
    dr.metadata.namespace = Some(experiment.service_namespace());
    dr.metadata.labels = Some(rule_labels(experiment));
    dr
}

/// VirtualService routing the target host to the two subsets, all traffic
/// initially on the baseline.
pub fn build_virtual_service(experiment: &Experiment) -> VirtualService {
    let host = &experiment.spec.target_service.name;
    let mut vs = VirtualService::new(
        &routing_rule_name(host),
        VirtualServiceSpec {
            hosts: vec![host.clone()],
            http: vec![HttpRoute {
                route: vec![
                    HttpRouteDestination {
                        destination: Destination {
                            host: host.clone(),
                            subset: Some(SUBSET_BASELINE.to_string()),
                        },
                        weight: Some(100),
                    },
                    HttpRouteDestination {
                        destination: Destination {
                            host: host.clone(),
                            subset: Some(SUBSET_CANDIDATE.to_string()),
                        },
                        weight: Some(0),
                    },
                ],
            }],
        },
    );
    vs.metadata.namespace = Some(experiment.service_namespace());
    vs.metadata.labels = Some(rule_labels(experiment));
    vs
}

/// Sets the candidate route weight to `candidate_percent` and the baseline
/// route weight to the remainder. Returns whether any weight changed.
pub fn reweight_routes(vs: &mut VirtualService, candidate_percent: i32) -> bool {
    let mut changed = false;
    for route in vs.spec.http.iter_mut() {
        for destination in route.route.iter_mut() {
            let desired = match destination.destination.subset.as_deref() {
                Some(SUBSET_BASELINE) => 100 - candidate_percent,
                Some(SUBSET_CANDIDATE) => candidate_percent,
                _ => 0,
            };
            if destination.weight != Some(desired) {
                destination.weight = Some(desired);
                changed = true;
            }
        }
    }
    changed
}

/// Reads the observed split off the route weights.
pub fn route_weights(vs: &VirtualService) -> TrafficSplit {
    let mut split = TrafficSplit::default();
    for route in &vs.spec.http {
        for destination in &route.route {
            match destination.destination.subset.as_deref() {
                Some(SUBSET_BASELINE) => split.baseline = destination.weight.unwrap_or(0),
                Some(SUBSET_CANDIDATE) => split.candidate = destination.weight.unwrap_or(0),
                _ => {}
            }
        }
    }
    split
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::experiment::{ExperimentSpec, TargetService};
    use kube::api::ObjectMeta;

    fn experiment() -> Experiment {
        Experiment {
            metadata: ObjectMeta {
                name: Some("reviews-experiment".to_string()),
                namespace: Some("bookinfo".to_string()),
                ..Default::default()
            },
            spec: ExperimentSpec {
                target_service: TargetService {
                    api_version: "v1".to_string(),
                    name: "reviews".to_string(),
                    namespace: None,
                    baseline: "reviews-v1".to_string(),
                    candidate: "reviews-v2".to_string(),
                },
                traffic_control: Default::default(),
                analysis: Default::default(),
                assessment: None,
            },
            status: None,
        }
    }

    #[test]
    fn destination_rule_declares_both_subsets() {
        let baseline_labels = BTreeMap::from([("version".to_string(), "v1".to_string())]);
        let candidate_labels = BTreeMap::from([("version".to_string(), "v2".to_string())]);
        let dr = build_destination_rule(&experiment(), baseline_labels, candidate_labels);

        assert_eq!(dr.spec.host, "reviews");
        assert_eq!(dr.spec.subsets.len(), 2);
        assert_eq!(dr.spec.subsets[0].name, SUBSET_BASELINE);
        assert_eq!(dr.spec.subsets[1].name, SUBSET_CANDIDATE);
        assert_eq!(
            dr.spec.subsets[0].labels.get("version"),
            Some(&"v1".to_string())
        );

        let labels = dr.metadata.labels.unwrap();
        assert_eq!(labels.get(ROLE_LABEL), Some(&ROLE_PROGRESSING.to_string()));
        assert_eq!(labels.get(HOST_LABEL), Some(&"reviews".to_string()));
        assert_eq!(
            labels.get(EXPERIMENT_LABEL),
            Some(&"reviews-experiment".to_string())
        );
        assert_eq!(labels.get(INIT_LABEL), Some(&"true".to_string()));
    }

    #[test]
    fn virtual_service_starts_pinned_to_baseline() {
        let vs = build_virtual_service(&experiment());
        assert_eq!(vs.spec.hosts, vec!["reviews".to_string()]);
        let split = route_weights(&vs);
        assert_eq!(split.baseline, 100);
        assert_eq!(split.candidate, 0);
    }

    #[test]
    fn reweight_shifts_between_subsets() {
        let mut vs = build_virtual_service(&experiment());
        assert!(reweight_routes(&mut vs, 35));
        let split = route_weights(&vs);
        assert_eq!(split.baseline, 65);
        assert_eq!(split.candidate, 35);
    }

    #[test]
    fn reweight_is_idempotent() {
        let mut vs = build_virtual_service(&experiment());
        assert!(reweight_routes(&mut vs, 35));
        assert!(!reweight_routes(&mut vs, 35));
    }

    #[test]
    fn rule_name_derives_from_host() {
        assert_eq!(routing_rule_name("reviews"), "reviews.iter8-experiment");
    }

    use http_body_util::BodyExt;
    use std::sync::{Arc, Mutex};

    const VS_COLLECTION: &str =
        "/apis/networking.istio.io/v1alpha3/namespaces/bookinfo/virtualservices";
    const DR_COLLECTION: &str =
        "/apis/networking.istio.io/v1alpha3/namespaces/bookinfo/destinationrules";
    const DEPLOYMENT_COLLECTION: &str = "/apis/apps/v1/namespaces/bookinfo/deployments";

    /// In-memory cluster API backing a real `kube::Client`: serves GET,
    /// LIST, POST and merge-PATCH from a path-keyed object store, so driver
    /// methods run end to end without a cluster.
    #[derive(Clone, Default)]
    struct ApiFixture {
        objects: Arc<Mutex<BTreeMap<String, Value>>>,
    }

    impl ApiFixture {
        fn client(&self) -> Client {
            let objects = self.objects.clone();
            let service = tower::service_fn(move |request: http::Request<kube::client::Body>| {
                let objects = objects.clone();
                async move { Ok::<_, std::convert::Infallible>(serve(&objects, request).await) }
            });
            Client::new(service, "bookinfo")
        }

        fn seed_deployment(&self, name: &str, version: &str) {
            let key = format!("{}/{}", DEPLOYMENT_COLLECTION, name);
            self.objects.lock().unwrap().insert(
                key,
                json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {"name": name, "namespace": "bookinfo"},
                    "spec": {
                        "selector": {"matchLabels": {"version": version}},
                        "template": {"metadata": {"labels": {"version": version}}}
                    }
                }),
            );
        }

        fn object(&self, key: &str) -> Option<Value> {
            self.objects.lock().unwrap().get(key).cloned()
        }
    }

    fn json_response(code: u16, body: Value) -> http::Response<kube::client::Body> {
        http::Response::builder()
            .status(code)
            .header("content-type", "application/json")
            .body(kube::client::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn not_found() -> http::Response<kube::client::Body> {
        json_response(
            404,
            json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "message": "not found",
                "reason": "NotFound",
                "code": 404
            }),
        )
    }

    /// Merge-patch semantics: null removes, objects merge, the rest replaces.
    fn merge_patch(target: &mut Value, patch: &Value) {
        match (target.as_object_mut(), patch.as_object()) {
            (Some(target), Some(patch)) => {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
            _ => *target = patch.clone(),
        }
    }

    async fn serve(
        objects: &Arc<Mutex<BTreeMap<String, Value>>>,
        request: http::Request<kube::client::Body>,
    ) -> http::Response<kube::client::Body> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let bytes = request
            .into_body()
            .collect()
            .await
            .expect("request body")
            .to_bytes();

        let mut objects = objects.lock().unwrap();
        match method.as_str() {
            "GET" => {
                if let Some(stored) = objects.get(&path) {
                    return json_response(200, stored.clone());
                }
                let is_collection = matches!(
                    path.rsplit('/').next(),
                    Some("virtualservices" | "destinationrules" | "deployments" | "services")
                );
                if is_collection {
                    let prefix = format!("{}/", path);
                    let items: Vec<Value> = objects
                        .iter()
                        .filter(|(key, _)| key.starts_with(&prefix))
                        .map(|(_, value)| value.clone())
                        .collect();
                    return json_response(
                        200,
                        json!({
                            "apiVersion": "v1",
                            "kind": "List",
                            "metadata": {"resourceVersion": "1"},
                            "items": items
                        }),
                    );
                }
                not_found()
            }
            "POST" => {
                let body: Value = serde_json::from_slice(&bytes).expect("valid JSON body");
                let name = body["metadata"]["name"].as_str().expect("named object");
                objects.insert(format!("{}/{}", path, name), body.clone());
                json_response(201, body)
            }
            "PATCH" => match objects.get_mut(&path) {
                Some(stored) => {
                    let patch: Value = serde_json::from_slice(&bytes).expect("valid JSON patch");
                    merge_patch(stored, &patch);
                    json_response(200, stored.clone())
                }
                None => not_found(),
            },
            _ => not_found(),
        }
    }

    #[tokio::test]
    async fn finalize_reweights_fresh_rules_instead_of_deleting() {
        let fixture = ApiFixture::default();
        fixture.seed_deployment("reviews-v1", "v1");
        fixture.seed_deployment("reviews-v2", "v2");
        let driver = IstioDriver::new(fixture.client());
        let exp = experiment();

        // attach() synthesizes the pair with the init marker; apply() moves
        // traffic mid-experiment.
        driver.attach(&exp).await.unwrap();
        driver.apply(&exp, 20).await.unwrap();

        let rule_key = format!("{}/{}", VS_COLLECTION, routing_rule_name("reviews"));
        let vs: VirtualService =
            serde_json::from_value(fixture.object(&rule_key).unwrap()).unwrap();
        assert_eq!(route_weights(&vs).candidate, 20);
        assert_eq!(vs.labels().get(INIT_LABEL), Some(&"true".to_string()));

        // Deletion mid-experiment: the pair survives, re-pinned to the
        // baseline and demoted to stable.
        driver.finalize(&exp).await.unwrap();

        let vs_value = fixture
            .object(&rule_key)
            .expect("virtual service still exists");
        let vs: VirtualService = serde_json::from_value(vs_value).unwrap();
        let split = route_weights(&vs);
        assert_eq!(split.baseline, 100);
        assert_eq!(split.candidate, 0);

        let labels = vs.metadata.labels.unwrap();
        assert_eq!(labels.get(ROLE_LABEL), Some(&ROLE_STABLE.to_string()));
        assert!(!labels.contains_key(EXPERIMENT_LABEL));
        assert!(!labels.contains_key(INIT_LABEL));

        let dr_key = format!("{}/{}", DR_COLLECTION, routing_rule_name("reviews"));
        assert!(
            fixture.object(&dr_key).is_some(),
            "destination rule still exists"
        );
    }
}
