//! Prometheus metrics server with singleton-based initialization, plus the
//! pipeline liveness endpoint.
//!
//! Key design decisions:
//! - `OnceLock` ensures thread-safe, one-time initialization
//! - `init_test()` handles race conditions where multiple test threads initialize
//! - `/health` reports stalled-pipeline liveness from the shared [`HealthState`]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use axum::{Extension, Json, Router, http::StatusCode, routing::get};
use chrono::Utc;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use snafu::prelude::*;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{
    AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu, PrometheusInitSnafu,
};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Default histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics controller singleton.
static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Shared pipeline liveness state behind the `/health` endpoint.
///
/// The pipeline heartbeats on every candidate outcome and on every export
/// progress tick; the probe reports
/// unhealthy when the last heartbeat is older than the grace period and the
/// run has not finished.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<HealthInner>,
}

struct HealthInner {
    /// Last heartbeat, milliseconds since the Unix epoch.
    last_heartbeat_ms: AtomicI64,
    done: AtomicBool,
    grace: Duration,
}

impl HealthState {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                last_heartbeat_ms: AtomicI64::new(Utc::now().timestamp_millis()),
                done: AtomicBool::new(false),
                grace,
            }),
        }
    }

    /// Mark the pipeline as alive right now.
    pub fn heartbeat(&self) {
        self.inner
            .last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Mark the run as finished; a quiet pipeline is then still healthy.
    pub fn mark_done(&self) {
        self.inner.done.store(true, Ordering::Relaxed);
    }

    fn ms_since_heartbeat(&self) -> i64 {
        Utc::now().timestamp_millis() - self.inner.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    /// Whether the pipeline counts as alive: finished, or heartbeat within grace.
    pub fn is_healthy(&self) -> bool {
        self.inner.done.load(Ordering::Relaxed)
            || self.ms_since_heartbeat() <= self.inner.grace.as_millis() as i64
    }
}

/// Controller for the shared metrics server.
pub struct MetricsController {
    handle: PrometheusHandle,
}

/// Initialize the metrics server for production use.
///
/// Starts an HTTP endpoint on the given address with:
/// - `/metrics` - Prometheus metrics in text format
/// - `/health` - Pipeline liveness probe
///
/// Metrics are always enabled - this should be called unconditionally at startup.
///
/// # Errors
///
/// Returns an error if:
/// - The server is already initialized
/// - The Prometheus recorder fails to initialize
pub fn init_global(addr: SocketAddr, health: HealthState) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .expect("valid bucket configuration")
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    let controller = MetricsController { handle };

    CONTROLLER
        .set(controller)
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    // Spawn the HTTP server in the background
    tokio::spawn(run_server(addr, health));

    info!(%addr, "Metrics server started");
    Ok(())
}

/// Initialize the metrics subsystem for tests.
///
/// Uses the same recorder setup but does NOT start an HTTP endpoint.
/// Handles the race condition where multiple test threads try to
/// initialize simultaneously by spinning until the controller is ready.
///
/// This function is safe to call multiple times from different test threads.
pub fn init_test() {
    if init_test_inner().is_err() {
        // Another thread is initializing. Wait for it to complete.
        while CONTROLLER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

fn init_test_inner() -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .expect("valid bucket configuration")
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    let controller = MetricsController { handle };

    CONTROLLER
        .set(controller)
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    Ok(())
}

impl MetricsController {
    /// Get a reference to the global metrics controller.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics have not been initialized.
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Run the HTTP server for metrics and health endpoints.
async fn run_server(addr: SocketAddr, health: HealthState) {
    let controller = CONTROLLER
        .get()
        .expect("controller initialized before server spawn");

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(controller.handle.clone()))
        .layer(Extension(health));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

/// Handler for `/metrics` endpoint.
async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

/// Handler for `/health` endpoint.
async fn health_handler(
    Extension(health): Extension<HealthState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let healthy = health.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = json!({
        "status": if healthy { "ok" } else { "stalled" },
        "msSinceLastHeartbeat": health.ms_since_heartbeat(),
        "done": health.inner.done.load(Ordering::Relaxed),
    });
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;
    use std::thread;

    #[test]
    fn test_init_test_is_idempotent() {
        // Should not panic on repeated calls
        init_test();
        init_test();
        init_test();

        // Controller should be available
        assert!(MetricsController::get().is_ok());
    }

    #[test]
    fn test_controller_render() {
        init_test();

        counter!("permafrost_test_counter").increment(42);

        let controller = MetricsController::get().unwrap();
        let output = controller.render();

        // The counter should appear in the output
        assert!(output.contains("permafrost_test_counter"));
    }

    #[test]
    fn test_concurrent_init_test() {
        let handles: Vec<_> = (0..10)
            .map(|_| {
                thread::spawn(|| {
                    init_test();
                    // All threads should see the controller
                    MetricsController::get().unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_health_state_transitions() {
        let health = HealthState::new(Duration::from_millis(0));
        // Grace of zero: any elapsed time is a stall.
        std::thread::sleep(Duration::from_millis(5));
        assert!(!health.is_healthy());

        health.heartbeat();
        let fresh = HealthState::new(Duration::from_secs(60));
        assert!(fresh.is_healthy());

        health.mark_done();
        assert!(health.is_healthy());
    }
}
