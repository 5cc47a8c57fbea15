use futures::StreamExt;
use iter8_controller::controller::analytics::HttpAnalyticsClient;
use iter8_controller::controller::clock::SystemClock;
use iter8_controller::controller::recorder::KubeEventSink;
use iter8_controller::controller::{reconcile, Context, ReconcileError};
use iter8_controller::crd::experiment::{Experiment, KNATIVE_SERVICE_V1ALPHA1, KUBERNETES_SERVICE};
use iter8_controller::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default port for health endpoints
const HEALTH_PORT: u16 = 8080;

/// Get controller namespace from env (default: iter8)
///
/// The metric catalog is looked up here before falling back to the
/// experiment's own namespace.
fn get_controller_namespace() -> String {
    std::env::var("ITER8_NAMESPACE").unwrap_or_else(|_| "iter8".to_string())
}

fn driver_label(experiment: &Experiment) -> &'static str {
    match experiment.spec.target_service.api_version.as_str() {
        KUBERNETES_SERVICE => "istio",
        KNATIVE_SERVICE_V1ALPHA1 => "knative",
        _ => "unknown",
    }
}

/// Error policy for the controller
///
/// Determines how to handle reconciliation errors:
/// - Requeue after delay
///
/// Uses `warn!` since reconciliation errors are expected and trigger retries.
pub fn error_policy(
    experiment: Arc<Experiment>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    warn!("Reconcile error (will retry): {:?}", error);

    if let Some(ref metrics) = ctx.metrics {
        // Duration unknown for errors (didn't complete), use 0
        metrics.record_reconciliation_error(driver_label(&experiment), 0.0);
    }

    Action::requeue(Duration::from_secs(10))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting iter8 experiment controller");

    // Create shutdown channel for coordinated shutdown
    let (shutdown_controller, _shutdown_signal) = shutdown_channel();

    // Create readiness state (initially not ready)
    let readiness = ReadinessState::new();

    // Create metrics registry
    let metrics = create_metrics().expect("Failed to create metrics registry");
    info!("Prometheus metrics registry initialized");

    // Create Kubernetes client
    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    // Start health server in background
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(HEALTH_PORT, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });
    info!(port = HEALTH_PORT, "Server task spawned");

    // Create API for Experiment resources
    let experiments = Api::<Experiment>::all(client.clone());

    // Analytics client; the endpoint itself comes from each Experiment's spec
    let analytics = Arc::new(HttpAnalyticsClient::new());

    // Event sink writing core/v1 Events; verbosity comes from RECORD_LEVEL
    let sink = Arc::new(KubeEventSink::new(client.clone()));

    // Create controller context (with metrics for observability)
    let ctx = Arc::new(Context::new(
        client.clone(),
        analytics,
        sink,
        Arc::new(SystemClock),
        get_controller_namespace(),
        Some(metrics.clone()),
    ));

    // Mark as ready - controller is initialized and about to start
    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // Create the controller stream
    // Note: error_policy already logs errors with warn!, so we only log success here
    let controller = Controller::new(experiments, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled: {:?}", o);
            }
            // Errors are logged in error_policy, no duplicate logging
        });

    // Run controller until shutdown signal received
    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            // Mark not ready so K8s stops sending traffic during shutdown
            readiness.set_not_ready();
        }
    }

    // Trigger shutdown for all components
    shutdown_controller.shutdown();

    info!("Stopping components...");
    health_handle.abort();

    info!("Controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
