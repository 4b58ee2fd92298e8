use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use pipeline::PipelineShared;

#[derive(Clone)]
struct AppState {
    prometheus: PrometheusHandle,
    shared: Arc<PipelineShared>,
}

/// Router of the embedded operational http server: Prometheus metrics and
/// the readiness probe.
pub fn build_router(shared: Arc<PipelineShared>) -> Router {
    let prometheus = PrometheusBuilder::new()
        .set_buckets(
            &prometheus::exponential_buckets(0.00001, 2.5, 15)
                .expect("calculating histogram buckets"),
        )
        .expect("calculating histogram buckets")
        .install_recorder()
        .expect("failed to install the prometheus recorder");

    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(AppState { prometheus, shared })
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.prometheus.render())
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.shared.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}
