//! Metric catalog sync
//!
//! Reads the cluster-stored `iter8-metrics` ConfigMap, filters its metric
//! definitions down to the experiment's success criteria, and resolves the
//! query templates each selected metric needs. Resolution is all-or-nothing:
//! either every criterion resolves or nothing is written to status.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::crd::experiment::{Experiment, ExperimentMetric, SuccessCriterion};

/// Name of the ConfigMap holding the metric catalog.
pub const METRICS_CONFIGMAP: &str = "iter8-metrics";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("MetricsConfigMapNotFound: ConfigMap {METRICS_CONFIGMAP} absent in both namespaces")]
    ConfigMapNotFound,

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to parse ConfigMap field {field}: {source}")]
    InvalidPayload {
        field: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no query template for metric {0}")]
    MissingQueryTemplate(String),

    #[error("no sample size template {key} for metric {name}")]
    MissingSampleSizeTemplate { name: String, key: String },
}

/// One entry of the catalog's `metrics` YAML list.
#[derive(Debug, Deserialize)]
struct CatalogMetric {
    name: String,
    #[serde(default)]
    is_counter: bool,
    #[serde(default)]
    absent_value: String,
    #[serde(default)]
    sample_size_query_template: String,
}

/// Resolves the catalog payload against the experiment's success criteria.
///
/// `data` holds the ConfigMap's two text fields: `metrics` (YAML list) and
/// `query_templates` (YAML map). Metrics not named by any criterion are
/// skipped; a criterion whose query or sample-size template is missing fails
/// the whole resolution.
pub fn resolve_metrics(
    data: &BTreeMap<String, String>,
    criteria: &[SuccessCriterion],
) -> Result<BTreeMap<String, ExperimentMetric>, CatalogError> {
    let templates: BTreeMap<String, String> = serde_yaml::from_str(
        data.get("query_templates")
            .map(String::as_str)
            .unwrap_or("{}"),
    )
    .map_err(|source| CatalogError::InvalidPayload {
        field: "query_templates",
        source,
    })?;

    let catalog: Vec<CatalogMetric> =
        serde_yaml::from_str(data.get("metrics").map(String::as_str).unwrap_or("[]")).map_err(
            |source| CatalogError::InvalidPayload {
                field: "metrics",
                source,
            },
        )?;

    let wanted: std::collections::BTreeSet<&str> =
        criteria.iter().map(|c| c.metric_name.as_str()).collect();

    let mut resolved = BTreeMap::new();
    for metric in catalog {
        if !wanted.contains(metric.name.as_str()) {
            continue;
        }

        let query_template = templates
            .get(&metric.name)
            .cloned()
            .ok_or_else(|| CatalogError::MissingQueryTemplate(metric.name.clone()))?;
        let sample_size_template = templates
            .get(&metric.sample_size_query_template)
            .cloned()
            .ok_or_else(|| CatalogError::MissingSampleSizeTemplate {
                name: metric.name.clone(),
                key: metric.sample_size_query_template.clone(),
            })?;

        resolved.insert(
            metric.name,
            ExperimentMetric {
                is_counter: metric.is_counter,
                absent_value: metric.absent_value,
                query_template,
                sample_size_template,
            },
        );
    }

    Ok(resolved)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Fetches the metric catalog and resolves it for the experiment.
///
/// The catalog is looked up in the controller's namespace first, falling
/// back to the experiment's namespace. The catalog is read-only from the
/// controller's perspective.
pub async fn sync_metrics(
    client: &Client,
    controller_namespace: &str,
    experiment: &Experiment,
) -> Result<BTreeMap<String, ExperimentMetric>, CatalogError> {
    let controller_api: Api<ConfigMap> = Api::namespaced(client.clone(), controller_namespace);

    let configmap = match controller_api.get(METRICS_CONFIGMAP).await {
        Ok(cm) => cm,
        Err(err) if is_not_found(&err) => {
            let namespace = experiment
                .metadata
                .namespace
                .as_deref()
                .unwrap_or("default");
            let fallback: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
            match fallback.get(METRICS_CONFIGMAP).await {
                Ok(cm) => cm,
                Err(err) if is_not_found(&err) => return Err(CatalogError::ConfigMapNotFound),
                Err(err) => return Err(err.into()),
            }
        }
        Err(err) => return Err(err.into()),
    };

    debug!(
        namespace = configmap.metadata.namespace.as_deref().unwrap_or(""),
        "metric catalog loaded"
    );

    let data = configmap.data.unwrap_or_default();
    resolve_metrics(&data, &experiment.spec.analysis.success_criteria)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "catalog_test.rs"]
mod tests;
