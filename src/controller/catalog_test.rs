use super::*;
use crate::crd::experiment::ToleranceType;

fn criterion(metric: &str) -> SuccessCriterion {
    SuccessCriterion {
        metric_name: metric.to_string(),
        tolerance_type: ToleranceType::Threshold,
        tolerance: 0.02,
        sample_size: Some(100),
        stop_on_failure: None,
    }
}

fn catalog_data() -> BTreeMap<String, String> {
    let metrics = r#"
- name: iter8_latency
  is_counter: false
  absent_value: "None"
  sample_size_query_template: iter8_sample_size
- name: iter8_error_rate
  is_counter: true
  absent_value: "0"
  sample_size_query_template: iter8_sample_size
"#;
    let templates = r#"
iter8_latency: sum(increase(istio_request_duration_seconds_sum{reporter='source'}[$interval]$offset_str)) by ($entity_labels)
iter8_error_rate: sum(increase(istio_requests_total{response_code=~'5..',reporter='source'}[$interval]$offset_str)) by ($entity_labels)
iter8_sample_size: sum(increase(istio_requests_total{reporter='source'}[$interval]$offset_str)) by ($entity_labels)
"#;
    BTreeMap::from([
        ("metrics".to_string(), metrics.to_string()),
        ("query_templates".to_string(), templates.to_string()),
    ])
}

#[test]
fn resolves_only_the_requested_metrics() {
    let resolved = resolve_metrics(&catalog_data(), &[criterion("iter8_latency")]).unwrap();

    assert_eq!(resolved.len(), 1);
    let metric = resolved.get("iter8_latency").unwrap();
    assert!(!metric.is_counter);
    assert_eq!(metric.absent_value, "None");
    assert!(metric.query_template.contains("istio_request_duration_seconds_sum"));
    assert!(metric.sample_size_template.contains("istio_requests_total"));
}

#[test]
fn resolves_every_criterion_or_nothing() {
    let mut data = catalog_data();
    // Drop the error-rate query template so one criterion cannot resolve.
    data.insert(
        "query_templates".to_string(),
        r#"
iter8_latency: query
iter8_sample_size: query
"#
        .to_string(),
    );

    let err = resolve_metrics(
        &data,
        &[criterion("iter8_latency"), criterion("iter8_error_rate")],
    )
    .unwrap_err();
    assert!(matches!(err, CatalogError::MissingQueryTemplate(name) if name == "iter8_error_rate"));
}

#[test]
fn missing_sample_size_template_fails() {
    let mut data = catalog_data();
    data.insert(
        "query_templates".to_string(),
        r#"
iter8_latency: query
iter8_error_rate: query
"#
        .to_string(),
    );

    let err = resolve_metrics(&data, &[criterion("iter8_latency")]).unwrap_err();
    assert!(matches!(
        err,
        CatalogError::MissingSampleSizeTemplate { name, key }
            if name == "iter8_latency" && key == "iter8_sample_size"
    ));
}

#[test]
fn empty_criteria_resolve_to_nothing() {
    let resolved = resolve_metrics(&catalog_data(), &[]).unwrap();
    assert!(resolved.is_empty());
}

#[test]
fn unknown_criterion_is_skipped_not_fatal() {
    // A criterion naming a metric absent from the catalog simply resolves
    // nothing for it; the analytics service rejects unknown metrics later.
    let resolved = resolve_metrics(&catalog_data(), &[criterion("no_such_metric")]).unwrap();
    assert!(resolved.is_empty());
}

#[test]
fn malformed_yaml_is_reported_per_field() {
    let mut data = catalog_data();
    data.insert("metrics".to_string(), "{not yaml".to_string());
    let err = resolve_metrics(&data, &[criterion("iter8_latency")]).unwrap_err();
    assert!(matches!(err, CatalogError::InvalidPayload { field: "metrics", .. }));
}
