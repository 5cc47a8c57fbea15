use super::*;
use crate::crd::experiment::{
    Analysis, ConditionStatus, ExperimentConditionType, ExperimentSpec, TargetService,
    KNATIVE_SERVICE_V1ALPHA1,
};
use chrono::{TimeZone, Utc};
use kube::api::ObjectMeta;

fn experiment() -> Experiment {
    let mut exp = Experiment {
        metadata: ObjectMeta {
            name: Some("exp".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: ExperimentSpec {
            target_service: TargetService {
                api_version: KNATIVE_SERVICE_V1ALPHA1.to_string(),
                name: "svc".to_string(),
                namespace: None,
                baseline: "rev-1".to_string(),
                candidate: "rev-2".to_string(),
            },
            traffic_control: Default::default(),
            analysis: Analysis::default(),
            assessment: None,
        },
        status: Some(Default::default()),
    };
    exp.status
        .as_mut()
        .unwrap()
        .init_conditions(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    exp
}

fn recorder(verbose: bool) -> (ConditionRecorder, Arc<MockEventSink>) {
    let sink = Arc::new(MockEventSink::new());
    (
        ConditionRecorder::with_verbosity(sink.clone(), verbose),
        sink,
    )
}

#[tokio::test]
async fn repeated_marks_emit_a_single_event() {
    let (recorder, sink) = recorder(false);
    let mut exp = experiment();
    let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 1, 0).unwrap();

    recorder.mark_targets_found(&mut exp, now).await;
    recorder.mark_targets_found(&mut exp, now).await;
    recorder.mark_targets_found(&mut exp, now).await;

    let events = sink.emitted();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "TargetsFound");
    assert_eq!(events[0].0, EventKind::Normal);
}

#[tokio::test]
async fn bad_transitions_always_warn() {
    let (recorder, sink) = recorder(false);
    let mut exp = experiment();
    let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 1, 0).unwrap();

    recorder
        .mark_analytics_error(&mut exp, "connection refused", now)
        .await;

    let events = sink.emitted();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, EventKind::Warning);
    assert_eq!(events[0].1, "AnalyticsServiceError");

    let condition = exp
        .status
        .as_ref()
        .unwrap()
        .condition(ExperimentConditionType::AnalyticsServiceNormal)
        .unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
}

#[tokio::test]
async fn quiet_progress_updates_skip_events_unless_verbose() {
    let (recorder, sink) = recorder(false);
    let mut exp = experiment();
    let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 1, 0).unwrap();

    recorder
        .mark_experiment_progress(&mut exp, false, "Iteration 1 Completed", now)
        .await;
    assert!(sink.emitted().is_empty());

    let (verbose_recorder, verbose_sink) = self::recorder(true);
    let mut exp = experiment();
    verbose_recorder
        .mark_experiment_progress(&mut exp, false, "Iteration 1 Completed", now)
        .await;
    assert_eq!(verbose_sink.emitted().len(), 1);
}

#[tokio::test]
async fn broadcast_progress_updates_emit_normally() {
    let (recorder, sink) = recorder(false);
    let mut exp = experiment();
    let now = Utc.with_ymd_and_hms(2020, 1, 1, 0, 1, 0).unwrap();

    recorder
        .mark_experiment_progress(&mut exp, true, "New Traffic, baseline: 80, candidate: 20", now)
        .await;
    let events = sink.emitted();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "ProgressUpdate");
}

#[tokio::test]
async fn transitions_refresh_the_timestamp_and_noops_do_not() {
    let (recorder, _sink) = recorder(false);
    let mut exp = experiment();
    let first = Utc.with_ymd_and_hms(2020, 1, 1, 0, 1, 0).unwrap();
    let second = Utc.with_ymd_and_hms(2020, 1, 1, 0, 2, 0).unwrap();

    recorder.mark_targets_found(&mut exp, first).await;
    let stamp = exp
        .status
        .as_ref()
        .unwrap()
        .condition(ExperimentConditionType::TargetsProvided)
        .unwrap()
        .last_transition_time
        .clone();

    // Same status, later clock: timestamp must not move.
    recorder.mark_targets_found(&mut exp, second).await;
    let unchanged = exp
        .status
        .as_ref()
        .unwrap()
        .condition(ExperimentConditionType::TargetsProvided)
        .unwrap()
        .last_transition_time
        .clone();
    assert_eq!(stamp, unchanged);

    // Real transition: timestamp moves.
    recorder
        .mark_targets_error(&mut exp, "Missing Candidate Revision: rev-2", second)
        .await;
    let moved = exp
        .status
        .as_ref()
        .unwrap()
        .condition(ExperimentConditionType::TargetsProvided)
        .unwrap()
        .last_transition_time
        .clone();
    assert_ne!(stamp, moved);
}

#[tokio::test]
async fn completion_stamps_the_window_and_clears_analysis_state() {
    let (recorder, sink) = recorder(false);
    let mut exp = experiment();
    {
        let status = exp.status.as_mut().unwrap();
        status.start_timestamp = "1577836800000".to_string();
        status.analysis_state = serde_json::json!({"carried": "state"});
    }
    let now = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();

    recorder
        .mark_experiment_succeeded(&mut exp, "AllSuccessCriteriaMet", now)
        .await;

    let status = exp.status.as_ref().unwrap();
    assert!(status.completed());
    assert_eq!(status.end_timestamp, now.timestamp_millis().to_string());
    assert_eq!(status.analysis_state, serde_json::json!({}));

    let url = status.grafana_url.as_ref().unwrap();
    assert!(url.contains("from=1577836800000"));
    assert!(url.contains(&format!("to={}", now.timestamp_millis())));

    let events = sink.emitted();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "ExperimentSucceeded");
}

#[tokio::test]
async fn aborts_complete_with_their_own_reason() {
    let (recorder, sink) = recorder(false);
    let mut exp = experiment();
    let now = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();

    recorder
        .mark_experiment_aborted(&mut exp, "Aborted, Traffic: AllToBaseline.", now)
        .await;

    let status = exp.status.as_ref().unwrap();
    assert!(status.completed());
    assert_eq!(status.completed_reason(), Some("Aborted"));
    assert_eq!(sink.emitted()[0].0, EventKind::Warning);
}
