//! HTTP server setup: router and handlers.

use super::ApiState;
use crate::error::EngineError;
use crate::protocol::{AgentCard, CancelRequest, ExecuteRequest, TaskEvent, TaskState};
use crate::QaRequest;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response, Sse};
use axum::routing::{get, post};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

// -- Response types --

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    text: String,
    /// Host context, e.g. the visible page content.
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    context_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    reply: String,
    context_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    task_id: String,
    context_id: String,
    state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

/// Engine errors mapped onto HTTP statuses.
struct ApiError(EngineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::ModelUnavailable { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Start the HTTP server on the given address.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/.well-known/agent.json", get(agent_card))
        .route("/chat", post(chat))
        .route("/a2a/message:send", post(message_send))
        .route("/a2a/message:stream", post(message_stream))
        .route("/a2a/tasks:cancel", post(task_cancel))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}

// -- Handlers --

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn agent_card(State(state): State<Arc<ApiState>>) -> Json<AgentCard> {
    Json(state.executor.agent_card().await)
}

/// Buffered question-in, answer-out endpoint for simple callers.
async fn chat(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let mut qa_request = QaRequest::new(request.text);
    if let Some(context_id) = request.context_id {
        qa_request = qa_request.with_context_id(context_id);
    }
    if let Some(context) = request.context {
        qa_request = qa_request.with_host_context(context);
    }

    let response = state
        .executor
        .engine()
        .answer(qa_request)
        .await
        .map_err(ApiError)?;

    Ok(Json(ChatResponse {
        reply: response.text,
        context_id: response.context_id,
    }))
}

/// Protocol execute call, buffered: runs the task to completion and
/// reports the terminal state plus the answer artifact.
async fn message_send(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ExecuteRequest>,
) -> Json<SendResponse> {
    let (tx, mut rx) = mpsc::channel(64);

    let execute = state.executor.execute(request, tx);
    let collect = async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    };
    let ((), events) = tokio::join!(execute, collect);

    let text = events.iter().find_map(|event| match event {
        TaskEvent::ArtifactUpdate { text, .. } => Some(text.clone()),
        _ => None,
    });

    // The executor guarantees a terminal status update.
    let (task_id, context_id, state) = events
        .iter()
        .rev()
        .find_map(|event| match event {
            TaskEvent::StatusUpdate {
                task_id,
                context_id,
                state,
                is_final: true,
                ..
            } => Some((task_id.clone(), context_id.clone(), *state)),
            _ => None,
        })
        .unwrap_or_else(|| (String::new(), String::new(), TaskState::Failed));

    Json(SendResponse {
        task_id,
        context_id,
        state,
        text,
    })
}

/// Protocol cancel call: acknowledges with the terminal canceled status.
/// In-flight work for the task is abandoned when its consumer disconnects
/// from the event stream.
async fn task_cancel(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CancelRequest>,
) -> Json<TaskEvent> {
    let context_id = request.context_id.unwrap_or_default();
    let (tx, mut rx) = mpsc::channel(1);
    state.executor.cancel(&request.task_id, &context_id, &tx).await;
    drop(tx);

    let event = rx.recv().await.unwrap_or(TaskEvent::StatusUpdate {
        task_id: request.task_id,
        context_id,
        state: TaskState::Canceled,
        message: None,
        is_final: true,
    });
    Json(event)
}

/// Protocol execute call, streaming: relays task events as SSE until the
/// terminal one.
async fn message_stream(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ExecuteRequest>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let (tx, mut rx) = mpsc::channel(64);

    tokio::spawn(async move {
        state.executor.execute(request, tx).await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let is_final = event.is_final();
            if let Ok(json) = serde_json::to_string(&event) {
                yield Ok(axum::response::sse::Event::default()
                    .event(event.event_name())
                    .data(json));
            }
            if is_final {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
