//! Tests for health and metrics endpoints

use super::*;
use std::time::Duration;

/// Wait for server to be ready with retry logic
///
/// Retries connection up to max_retries times with exponential backoff.
/// More reliable than fixed sleep for test environments.
async fn wait_for_server(port: u16, max_retries: u32) -> reqwest::Client {
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);

    for attempt in 1..=max_retries {
        match client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await
        {
            Ok(_) => return client,
            Err(_) if attempt < max_retries => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("Server not ready after {} attempts: {}", max_retries, e),
        }
    }
    client
}

#[tokio::test]
async fn healthz_returns_200() {
    let readiness = ReadinessState::new();
    let metrics = create_metrics().expect("metrics registry");
    let port = 18080; // Use high port for tests

    let server_readiness = readiness.clone();
    let server_handle =
        tokio::spawn(async move { run_health_server(port, server_readiness, metrics).await });

    let client = wait_for_server(port, 10).await;

    let response = client
        .get(format!("http://127.0.0.1:{}/healthz", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server");

    assert_eq!(response.status(), 200, "Liveness probe should return 200");

    server_handle.abort();
}

#[tokio::test]
async fn readyz_returns_503_when_not_ready() {
    let readiness = ReadinessState::new();
    assert!(!readiness.is_ready(), "Should start as not ready");
    let metrics = create_metrics().expect("metrics registry");
    let port = 18081;

    let server_readiness = readiness.clone();
    let server_handle =
        tokio::spawn(async move { run_health_server(port, server_readiness, metrics).await });

    let client = wait_for_server(port, 10).await;

    let response = client
        .get(format!("http://127.0.0.1:{}/readyz", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server");

    assert_eq!(
        response.status(),
        503,
        "Readiness probe should return 503 when not ready"
    );

    server_handle.abort();
}

#[tokio::test]
async fn readyz_returns_200_when_ready() {
    let readiness = ReadinessState::new();
    readiness.set_ready();
    let metrics = create_metrics().expect("metrics registry");
    let port = 18082;

    let server_readiness = readiness.clone();
    let server_handle =
        tokio::spawn(async move { run_health_server(port, server_readiness, metrics).await });

    let client = wait_for_server(port, 10).await;

    let response = client
        .get(format!("http://127.0.0.1:{}/readyz", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server");

    assert_eq!(
        response.status(),
        200,
        "Readiness probe should return 200 when ready"
    );

    server_handle.abort();
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let readiness = ReadinessState::new();
    let metrics = create_metrics().expect("metrics registry");
    metrics.record_reconciliation("knative", 0.01);
    let port = 18083;

    let server_readiness = readiness.clone();
    let server_metrics = metrics.clone();
    let server_handle = tokio::spawn(async move {
        run_health_server(port, server_readiness, server_metrics).await
    });

    let client = wait_for_server(port, 10).await;

    let response = client
        .get(format!("http://127.0.0.1:{}/metrics", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server");

    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("metrics body");
    assert!(body.contains("iter8_reconciliations_total"));

    server_handle.abort();
}

/// Test ReadinessState basic functionality
#[test]
fn readiness_state_transitions() {
    let state = ReadinessState::new();

    // Initially not ready
    assert!(!state.is_ready());

    state.set_ready();
    assert!(state.is_ready());

    // Clone should share state
    let cloned = state.clone();
    assert!(cloned.is_ready());

    state.set_not_ready();
    assert!(!cloned.is_ready());
}
