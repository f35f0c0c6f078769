//! In-process HTTP bridge that lets sandbox code re-enter the LLM.
//!
//! Bound to `127.0.0.1` on an ephemeral port; the paired sandbox receives
//! the resulting address at spawn time. Each successful sub-query is
//! recorded into the shared [`SubCallSink`], attributing it to the sandbox
//! execution that is currently in flight.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::LlmClient;
use crate::error::Result;
use crate::error::RlmError;
use crate::sandbox::SubCallSink;
use crate::types::Message;
use crate::types::SubCall;

#[derive(Clone)]
struct BridgeState {
    client: Arc<dyn LlmClient>,
    sink: SubCallSink,
    batch_concurrency: usize,
}

pub struct CallbackBridge {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CallbackBridge {
    /// Binds a listener on an OS-assigned port and serves until
    /// [`CallbackBridge::stop`]. The reported address is what sandbox code
    /// dials for `llm_query` / `llm_query_batched`.
    pub async fn start(
        client: Arc<dyn LlmClient>,
        sink: SubCallSink,
        batch_concurrency: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(RlmError::Bridge)?;
        let addr = listener.local_addr().map_err(RlmError::Bridge)?;

        let state = BridgeState {
            client,
            sink,
            batch_concurrency: batch_concurrency.max(1),
        };
        let app = Router::new()
            .route("/query", post(handle_query))
            .route("/query_batched", post(handle_query_batched))
            .with_state(state);

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(err) = server.await {
                tracing::warn!(error = %err, "callback bridge exited with error");
            }
        });

        tracing::debug!(%addr, "callback bridge listening");

        Ok(Self {
            addr,
            shutdown,
            task: Some(task),
        })
    }

    /// `host:port` string for the sandbox environment.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Cooperative shutdown: stops accepting connections and drains
    /// in-flight handlers before returning.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CallbackBridge {
    fn drop(&mut self) {
        // Backstop for early-exit paths that never reached stop().
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    prompt: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct BatchedQueryRequest {
    prompts: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchedQueryResponse {
    responses: Vec<String>,
}

async fn handle_query(State(state): State<BridgeState>, Json(req): Json<QueryRequest>) -> Response {
    log_model_override(req.model.as_deref());

    let messages = [Message::user(req.prompt.clone())];
    match state.client.completion(&messages).await {
        Ok(response) => {
            state
                .sink
                .record(SubCall {
                    model: state.client.model_name().to_string(),
                    prompt: req.prompt,
                    response: response.clone(),
                })
                .await;
            (StatusCode::OK, Json(QueryResponse { response })).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn handle_query_batched(
    State(state): State<BridgeState>,
    Json(req): Json<BatchedQueryRequest>,
) -> Response {
    log_model_override(req.model.as_deref());

    let mut responses = vec![String::new(); req.prompts.len()];
    let results = futures::stream::iter(req.prompts.into_iter().enumerate())
        .map(|(index, prompt)| {
            let client = Arc::clone(&state.client);
            let sink = state.sink.clone();
            async move {
                let messages = [Message::user(prompt.clone())];
                match client.completion(&messages).await {
                    Ok(response) => {
                        sink.record(SubCall {
                            model: client.model_name().to_string(),
                            prompt,
                            response: response.clone(),
                        })
                        .await;
                        (index, response)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, index, "batched sub-query failed");
                        (index, String::new())
                    }
                }
            }
        })
        .buffer_unordered(state.batch_concurrency)
        .collect::<Vec<(usize, String)>>()
        .await;

    for (index, response) in results {
        responses[index] = response;
    }

    (StatusCode::OK, Json(BatchedQueryResponse { responses })).into_response()
}

fn log_model_override(model: Option<&str>) {
    if let Some(model) = model {
        tracing::debug!(requested = %model, "per-call model override is not routed; using the root client");
    }
}
