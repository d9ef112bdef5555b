//! HTTP service exposing the pipeline.
//!
//! `GET /api/prices?search=<term>` answers with the serialized
//! [`PipelineResult`] or with `{error, message}` and a non-2xx status.

use crate::{PipelineError, PipelineResult, PricePipeline, SystemHealthChecker};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PricePipeline>,
    pub health: Arc<SystemHealthChecker>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(pipeline: Arc<PricePipeline>) -> Self {
        Self {
            health: Arc::new(SystemHealthChecker::new(pipeline.clone())),
            pipeline,
            prometheus: None,
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    search: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::NavigationTimeout(_) | PipelineError::Timeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            PipelineError::LaunchFailure(_) | PipelineError::Overloaded => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::Navigation(_)
            | PipelineError::CaptureFailure(_)
            | PipelineError::RecognitionFailure(_) => StatusCode::BAD_GATEWAY,
            PipelineError::ConfigurationError(_)
            | PipelineError::IoError(_)
            | PipelineError::SerializationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind().as_str().to_string(),
            message: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

pub fn router(state: AppState, cors: bool) -> Router {
    let app = Router::new()
        .route("/", get(index))
        .route("/api/prices", get(search_prices))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state);

    if cors {
        app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        app
    }
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(
    addr: SocketAddr,
    state: AppState,
    cors: bool,
    shutdown: F,
) -> Result<(), PipelineError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = router(state, cors);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Price service listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Price service stopped");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn index() -> &'static str {
    concat!(
        "price-lens ",
        env!("CARGO_PKG_VERSION"),
        "\nGET /api/prices?search=<term>\n"
    )
}

async fn search_prices(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<PipelineResult>, PipelineError> {
    let Query(params) =
        params.map_err(|rejection| PipelineError::InvalidInput(rejection.body_text()))?;
    let term = params.search.unwrap_or_default();
    state.pipeline.run(&term).await.map(Json)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check_system_health().await)
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled\n").into_response(),
    }
}
