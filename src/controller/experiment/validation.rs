use std::time::Duration;

use crate::crd::experiment::Experiment;

/// Validate Experiment specification
///
/// Validates runtime constraints that cannot be enforced via CRD schema.
/// Runs before any routing mutation; a failing spec leaves the cluster
/// untouched until the operator edits it.
///
/// # Validation Rules
/// - `targetService.name`, `baseline` and `candidate` cannot be empty
/// - `baseline` and `candidate` must name different revisions
/// - `trafficControl.maxIterations` must be >= 1
/// - `trafficControl.stepSize` must be 0-100
/// - `trafficControl.intervalDuration` must be valid format (e.g., "30s", "5m")
pub fn validate_experiment(experiment: &Experiment) -> Result<(), String> {
    let target = &experiment.spec.target_service;

    if target.name.is_empty() {
        return Err("spec.targetService.name cannot be empty".to_string());
    }
    if target.baseline.is_empty() {
        return Err("spec.targetService.baseline cannot be empty".to_string());
    }
    if target.candidate.is_empty() {
        return Err("spec.targetService.candidate cannot be empty".to_string());
    }
    if target.baseline == target.candidate {
        return Err(format!(
            "spec.targetService.baseline and candidate must differ, both are {}",
            target.baseline
        ));
    }

    let traffic = &experiment.spec.traffic_control;

    if let Some(max_iterations) = traffic.max_iterations {
        if max_iterations < 1 {
            return Err(format!(
                "spec.trafficControl.maxIterations must be >= 1, got {}",
                max_iterations
            ));
        }
    }

    if let Some(step_size) = traffic.step_size {
        if !(0..=100).contains(&step_size) {
            return Err(format!(
                "spec.trafficControl.stepSize must be 0-100, got {}",
                step_size
            ));
        }
    }

    if let Some(interval) = &traffic.interval_duration {
        if parse_duration(interval).is_none() {
            return Err(format!(
                "spec.trafficControl.intervalDuration invalid: {}",
                interval
            ));
        }
    }

    Ok(())
}

/// Parse a duration string like "5m", "30s", "1h" into std::time::Duration
///
/// Supported formats:
/// - "30s" → 30 seconds (max 24h = 86400s)
/// - "5m" → 5 minutes (max 24h = 1440m)
/// - "2h" → 2 hours (max 1 week = 168h)
///
/// Zero durations are rejected, as are values past the per-unit limits
/// (those are almost always typos).
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();

    if duration_str.is_empty() {
        return None;
    }

    let unit = duration_str.chars().last()?;
    let number_str = &duration_str[..duration_str.len() - 1];
    let number: u64 = number_str.parse().ok()?;

    if number == 0 {
        return None;
    }

    match unit {
        's' => {
            if number <= 86400 {
                Some(Duration::from_secs(number))
            } else {
                None
            }
        }
        'm' => {
            if number <= 1440 {
                number.checked_mul(60).map(Duration::from_secs)
            } else {
                None
            }
        }
        'h' => {
            if number <= 168 {
                number.checked_mul(3600).map(Duration::from_secs)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::experiment::{ExperimentSpec, TargetService, TrafficControl};
    use kube::api::ObjectMeta;

    fn experiment(traffic: TrafficControl) -> Experiment {
        Experiment {
            metadata: ObjectMeta {
                name: Some("exp".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ExperimentSpec {
                target_service: TargetService {
                    api_version: "serving.knative.dev/v1alpha1".to_string(),
                    name: "svc".to_string(),
                    namespace: None,
                    baseline: "rev-1".to_string(),
                    candidate: "rev-2".to_string(),
                },
                traffic_control: traffic,
                analysis: Default::default(),
                assessment: None,
            },
            status: None,
        }
    }

    #[test]
    fn valid_spec_passes() {
        let traffic = TrafficControl {
            max_iterations: Some(10),
            step_size: Some(20),
            interval_duration: Some("30s".to_string()),
            ..Default::default()
        };
        assert!(validate_experiment(&experiment(traffic)).is_ok());
    }

    #[test]
    fn defaults_pass() {
        assert!(validate_experiment(&experiment(TrafficControl::default())).is_ok());
    }

    #[test]
    fn zero_iterations_rejected() {
        let traffic = TrafficControl {
            max_iterations: Some(0),
            ..Default::default()
        };
        let err = validate_experiment(&experiment(traffic)).unwrap_err();
        assert!(err.contains("maxIterations"));
    }

    #[test]
    fn step_size_out_of_range_rejected() {
        let traffic = TrafficControl {
            step_size: Some(101),
            ..Default::default()
        };
        let err = validate_experiment(&experiment(traffic)).unwrap_err();
        assert!(err.contains("stepSize"));
    }

    #[test]
    fn bad_interval_rejected() {
        let traffic = TrafficControl {
            interval_duration: Some("soon".to_string()),
            ..Default::default()
        };
        let err = validate_experiment(&experiment(traffic)).unwrap_err();
        assert!(err.contains("intervalDuration"));
    }

    #[test]
    fn identical_revisions_rejected() {
        let mut exp = experiment(TrafficControl::default());
        exp.spec.target_service.candidate = "rev-1".to_string();
        let err = validate_experiment(&exp).unwrap_err();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn empty_candidate_rejected() {
        let mut exp = experiment(TrafficControl::default());
        exp.spec.target_service.candidate = String::new();
        assert!(validate_experiment(&exp).is_err());
    }

    #[test]
    fn parse_duration_accepts_supported_units() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn parse_duration_rejects_zero_and_garbage() {
        assert_eq!(parse_duration("0s"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("10d"), None);
        assert_eq!(parse_duration("999999h"), None);
    }
}
