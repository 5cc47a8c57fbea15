//! Minimal typed views of the Knative Serving resources the serverless
//! traffic driver manipulates. Only the fields the controller reads or
//! writes are modeled; everything else survives round-trips untouched on
//! the server side because updates go through the typed API.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// serving.knative.dev/v1alpha1 Service. The traffic driver rebalances the
/// percentages in `spec.traffic` and holds the ownership label on metadata.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "serving.knative.dev",
    version = "v1alpha1",
    kind = "Service",
    namespaced
)]
pub struct ServiceSpec {
    /// Ordered list of revisions receiving traffic. Percentages must sum
    /// to 100 across the whole list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TrafficTarget {
    #[serde(rename = "revisionName", default)]
    pub revision_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<i64>,
}

/// serving.knative.dev/v1alpha1 Revision. Read-only from the controller's
/// perspective; only the backing core-service name matters.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "serving.knative.dev",
    version = "v1alpha1",
    kind = "Revision",
    namespaced,
    status = "RevisionStatus"
)]
pub struct RevisionSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct RevisionStatus {
    /// Name of the core Service fronting this revision's pods.
    #[serde(rename = "serviceName", skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}
