//! HTTP front door for the RLM engine: `POST /completion` runs one
//! completion, `GET /metrics` serves the Prometheus registry.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use rlm_core::GeminiClient;
use rlm_core::LlmClient;
use rlm_core::Rlm;
use rlm_core::RlmSettings;
use rlm_core::observability::HTTP_REQUEST_DURATION;
use rlm_core::observability::HTTP_REQUESTS_TOTAL;
use rlm_core::observability::render_metrics;

#[derive(Clone)]
struct AppState {
    client: Arc<dyn LlmClient>,
    settings: RlmSettings,
}

#[derive(Debug, Deserialize)]
struct CompletionRequest {
    prompt: String,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    max_iterations: Option<u32>,
}

fn app(state: AppState) -> Router {
    rlm_core::observability::init();
    Router::new()
        .route("/completion", post(handle_completion))
        .route("/metrics", get(handle_metrics))
        .layer(middleware::from_fn(track_http_metrics))
        .with_state(state)
}

async fn handle_completion(
    State(state): State<AppState>,
    Json(req): Json<CompletionRequest>,
) -> Response {
    if req.prompt.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Prompt is required");
    }

    let settings = state.settings.clone().with_max_iterations(req.max_iterations);
    let engine = Rlm::new(Arc::clone(&state.client), settings);

    match engine
        .completion(&req.prompt, req.context, CancellationToken::new())
        .await
    {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "rlm completion failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn handle_metrics() -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        render_metrics(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn track_http_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[
            method.as_str(),
            path.as_str(),
            status.canonical_reason().unwrap_or("unknown"),
        ])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), path.as_str()])
        .observe(duration);
    tracing::info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration,
        "request handled"
    );

    response
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let settings = RlmSettings::from_env();
    let client = Arc::new(
        GeminiClient::new(String::new(), settings.model.clone())
            .context("failed to create gemini client")?,
    );

    let state = AppState {
        client,
        settings: settings.clone(),
    };

    let listener = TcpListener::bind(("0.0.0.0", settings.port))
        .await
        .with_context(|| format!("failed to bind port {}", settings.port))?;
    tracing::info!(port = settings.port, "starting server");

    let shutdown = CancellationToken::new();
    let serve_token = shutdown.clone();
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, app(state))
            .with_graceful_shutdown(async move { serve_token.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut server_task => {
            result.context("server task panicked")??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("shutting down server");
    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(10), &mut server_task).await {
        Ok(result) => result.context("server task panicked")??,
        Err(_) => {
            tracing::error!("server forced to shutdown");
            server_task.abort();
        }
    }

    tracing::info!("server exited properly");
    Ok(())
}
