//! HTTP routes and the `/ws` endpoint.
//!
//! Handlers are thin: they validate input, call into the runtime's services,
//! and render [`BridgeError`] as `{error, category, hint?}`.

use crate::agent_path::AgentPath;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ErrorCategory};
use crate::protocol::{
    ActionResponse, AgentOutput, HealthResponse, MayorOutput, NudgeRequest, NudgeResponse,
    ServerMessage,
};
use crate::runtime::BridgeRuntime;
use crate::tmux::DEFAULT_CAPTURE_LINES;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode, header, request};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};

/// Frames buffered per WebSocket client before broadcasts start dropping.
const OUTBOUND_CAPACITY: usize = 256;

const DEFAULT_MESSAGE_LIMIT: usize = 50;
const DEFAULT_MAYOR_LINES: usize = 100;

/// Build the application router over `runtime`.
pub fn router(runtime: BridgeRuntime) -> Router {
    let cors = cors_layer(runtime.config());
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/agents", get(agents))
        .route("/api/polecat/:rig/:name/output", get(polecat_output))
        .route("/api/polecat/:rig/:name/stop", post(polecat_stop))
        .route("/api/nudge", post(nudge))
        .route("/api/mayor/messages", get(mayor_messages))
        .route("/api/mayor/output", get(mayor_output))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .with_state(runtime)
}

fn cors_layer(config: &BridgeConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    if config.allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let allowed = config.allowed_origins.clone();
    let allow_null = config.allow_null_origin;
    layer.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _: &request::Parts| {
            origin.to_str().is_ok_and(|origin| {
                (allow_null && origin == "null") || allowed.iter().any(|a| a == origin)
            })
        },
    ))
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let code = match self.category() {
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::NotRunning | ErrorCategory::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCategory::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::CommandFailed | ErrorCategory::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let mut body = json!({
            "error": self.to_string(),
            "category": self.category(),
        });
        if let Some(hint) = self.hint() {
            body["hint"] = Value::from(hint);
        }
        (code, Json(body)).into_response()
    }
}

/// Query parameters are parsed leniently: anything unparsable means "default".
#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    refresh: Option<String>,
    lines: Option<String>,
    limit: Option<String>,
}

impl ListQuery {
    fn refresh(&self) -> bool {
        matches!(self.refresh.as_deref(), Some("true" | "1"))
    }

    fn lines(&self, default: usize) -> usize {
        lenient(self.lines.as_deref(), default)
    }

    fn limit(&self, default: usize) -> usize {
        lenient(self.limit.as_deref(), default)
    }
}

fn lenient(value: Option<&str>, default: usize) -> usize {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

async fn health(State(runtime): State<BridgeRuntime>) -> Json<HealthResponse> {
    Json(runtime.health())
}

async fn status(
    State(runtime): State<BridgeRuntime>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, BridgeError> {
    runtime.status().get_status(query.refresh()).await.map(Json)
}

async fn agents(
    State(runtime): State<BridgeRuntime>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, BridgeError> {
    runtime.agents().list_agents(query.refresh()).await.map(Json)
}

async fn polecat_output(
    State(runtime): State<BridgeRuntime>,
    Path((rig, name)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<AgentOutput>, BridgeError> {
    let path = AgentPath::new(&rig, &name)?;
    let lines = query.lines(DEFAULT_CAPTURE_LINES);
    Ok(Json(runtime.agents().agent_output(&path, lines).await))
}

async fn polecat_stop(
    State(runtime): State<BridgeRuntime>,
    Path((rig, name)): Path<(String, String)>,
) -> Result<Json<ActionResponse>, BridgeError> {
    let path = AgentPath::new(&rig, &name)?;
    runtime.agents().stop_agent(&path).await.map(Json)
}

async fn nudge(
    State(runtime): State<BridgeRuntime>,
    Json(request): Json<NudgeRequest>,
) -> Result<Json<NudgeResponse>, BridgeError> {
    runtime.agents().nudge(request).await.map(Json)
}

async fn mayor_messages(
    State(runtime): State<BridgeRuntime>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let messages = runtime
        .agents()
        .recent_messages(query.limit(DEFAULT_MESSAGE_LIMIT));
    Json(json!({ "messages": messages }))
}

async fn mayor_output(
    State(runtime): State<BridgeRuntime>,
    Query(query): Query<ListQuery>,
) -> Json<MayorOutput> {
    Json(
        runtime
            .agents()
            .mayor_output(query.lines(DEFAULT_MAYOR_LINES))
            .await,
    )
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(runtime): State<BridgeRuntime>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(runtime, socket))
}

async fn handle_socket(runtime: BridgeRuntime, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(OUTBOUND_CAPACITY);
    let write_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.to_string())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let connection = runtime.attach_connection(tx);
    let id = connection.id();
    match runtime.status().get_status(false).await {
        Ok(status) => {
            connection.send(&ServerMessage::Status(status));
        }
        Err(e) => warn!(conn_id = id, error = %e, "Initial status unavailable"),
    }

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(text))) => {
                    debug!(conn_id = id, len = text.len(), "Ignoring client frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id = id, error = %e, "WebSocket read error");
                    break;
                }
            },
            () = runtime.shutdown_requested() => break,
        }
    }

    drop(connection);
    runtime.detach_connection(id);
    let _ = write_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_numbers() {
        assert_eq!(lenient(Some("20"), 50), 20);
        assert_eq!(lenient(Some(" 7 "), 50), 7);
        assert_eq!(lenient(Some("abc"), 50), 50);
        assert_eq!(lenient(Some("0"), 50), 50);
        assert_eq!(lenient(None, 100), 100);
    }

    #[test]
    fn test_refresh_flag() {
        let query = |v: &str| ListQuery {
            refresh: Some(v.to_string()),
            ..ListQuery::default()
        };
        assert!(query("true").refresh());
        assert!(query("1").refresh());
        assert!(!query("no").refresh());
        assert!(!ListQuery::default().refresh());
    }

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (BridgeError::NotFound { what: "x".into() }, StatusCode::NOT_FOUND),
            (BridgeError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (BridgeError::Unavailable("gt".into()), StatusCode::SERVICE_UNAVAILABLE),
            (BridgeError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, code) in cases {
            assert_eq!(err.into_response().status(), code);
        }
    }
}
