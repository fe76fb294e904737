use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sheetpilot_events::NotificationFilter;
use sheetpilot_kernel::{Kernel, KernelBuilder, KernelConfig, SessionContext};
use sheetpilot_policy::PolicySet;
use sheetpilot_protocol::{
    ApprovalId, ApprovalResponse, ApprovalTicket, Envelope, JSONRPC_VERSION, Notification,
    Priority, SessionId, ToolCapability,
};
use sheetpilot_tools::InMemoryGridBackend;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "sheetpilot-api")]
#[command(about = "sheetpilot session API")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8788")]
    listen: SocketAddr,
    /// JSON kernel configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory for persisted ledger snapshots.
    #[arg(long)]
    store: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    kernel: Kernel,
}

#[derive(Debug, Deserialize, Default)]
struct CreateSessionRequest {
    /// Reopen a persisted session instead of starting a fresh one.
    session_id: Option<SessionId>,
    policy: Option<PolicySet>,
}

#[derive(Debug, Serialize)]
struct SessionCreated {
    session_id: SessionId,
    capabilities: Vec<ToolCapability>,
}

#[derive(Debug, Deserialize)]
struct ResolveApprovalRequest {
    approved: bool,
    payload: Option<Value>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct NotificationStreamQuery {
    source: Option<String>,
    category: Option<String>,
    min_priority: Option<Priority>,
    /// Replay retained notifications before live ones. Defaults to true.
    replay: Option<bool>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => KernelConfig::from_json_file(path)?,
        None => KernelConfig::default(),
    };
    if let Some(root) = cli.store.clone() {
        config.persistence.root = Some(root);
    }

    let state = AppState {
        kernel: KernelBuilder::new(config).build(),
    };
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, "sheetpilot-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.kernel.clone()))
        .await?;

    state.kernel.flush().await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(create_session))
        .route("/sessions/{session_id}", axum::routing::delete(close_session))
        .route("/sessions/{session_id}/rpc", post(rpc))
        .route("/sessions/{session_id}/approvals", get(list_approvals))
        .route(
            "/sessions/{session_id}/approvals/{approval_id}",
            post(resolve_approval),
        )
        .route(
            "/sessions/{session_id}/notifications/stream",
            get(stream_notifications),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "sheetpilot-api"
    }))
}

fn session(state: &AppState, raw: &str) -> ApiResult<Arc<SessionContext>> {
    state
        .kernel
        .session(&SessionId::from(raw))
        .ok_or_else(|| ApiError::not_found(format!("unknown session {raw}")))
}

async fn create_session(
    State(state): State<AppState>,
    request: Option<Json<CreateSessionRequest>>,
) -> ApiResult<(StatusCode, Json<SessionCreated>)> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let context = match request.session_id {
        Some(session_id) => state.kernel.open_session(session_id).await,
        None => state.kernel.create_session().await,
    }
    .map_err(ApiError::internal)?;

    if context.backends().is_empty() {
        context
            .register_backend(Arc::new(InMemoryGridBackend::new("excel", "excel")))
            .await
            .map_err(ApiError::internal)?;
    }
    if let Some(policy) = &request.policy {
        state
            .kernel
            .policy()
            .set_policy(context.session_id(), policy)
            .await;
    }

    info!(session_id = %context.session_id(), "session created");
    Ok((
        StatusCode::CREATED,
        Json(SessionCreated {
            session_id: context.session_id().clone(),
            capabilities: context.capabilities(),
        }),
    ))
}

async fn close_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<StatusCode> {
    if state.kernel.close_session(&SessionId::from(session_id.as_str())) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("unknown session {session_id}")))
    }
}

/// Envelope errors are answered in-band like any other JSON-RPC failure.
async fn rpc(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let context = session(&state, &session_id)?;
    let envelope = match Envelope::from_value(body) {
        Ok(envelope) => envelope,
        Err(error) => {
            let body = json!({ "jsonrpc": JSONRPC_VERSION, "id": Value::Null, "error": error });
            return Ok(Json(body).into_response());
        }
    };

    Ok(match context.handle_envelope(envelope).await {
        Some(response) => Json(response.to_value()).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    })
}

async fn list_approvals(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ApprovalTicket>>> {
    Ok(Json(session(&state, &session_id)?.pending_approvals()))
}

async fn resolve_approval(
    Path((session_id, approval_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(request): Json<ResolveApprovalRequest>,
) -> ApiResult<StatusCode> {
    let context = session(&state, &session_id)?;
    let response = ApprovalResponse {
        approved: request.approved,
        payload: request.payload,
        reason: request.reason,
    };
    if context.resolve_approval(&ApprovalId::from(approval_id.as_str()), response) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "approval {approval_id} is not pending"
        )))
    }
}

async fn stream_notifications(
    Path(session_id): Path<String>,
    Query(query): Query<NotificationStreamQuery>,
    State(state): State<AppState>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let context = session(&state, &session_id)?;

    let mut filter = NotificationFilter::all();
    if let Some(source) = query.source {
        filter = filter.source(source);
    }
    if let Some(category) = &query.category {
        filter = filter.category(category.as_str());
    }
    if let Some(min_priority) = query.min_priority {
        filter = filter.predicate(move |notification| notification.priority >= min_priority);
    }

    // Subscribe before reading the ring so nothing published in between is lost.
    let live = context.subscribe_stream(filter.clone());
    let replayed = if query.replay.unwrap_or(true) {
        context.notifications(&filter)
    } else {
        Vec::new()
    };

    let stream = stream! {
        let mut replayed_ids = HashSet::new();
        for notification in replayed {
            replayed_ids.insert(notification.id.clone());
            yield Ok(as_sse_event(&notification));
        }

        let mut live = std::pin::pin!(live);
        while let Some(notification) = live.next().await {
            // Published between subscribing and reading the ring.
            if replayed_ids.remove(&notification.id) {
                continue;
            }
            yield Ok(as_sse_event(&notification));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn as_sse_event(notification: &Notification) -> Event {
    let payload = serde_json::to_string(notification)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    Event::default()
        .id(notification.id.to_string())
        .event(notification.event.clone())
        .data(payload)
}

/// Resolves on Ctrl+C or SIGTERM. Closing every session cancels pending
/// approvals, so gated calls still in flight can answer before the server
/// drains its connections.
async fn shutdown_signal(kernel: Kernel) {
    let signal = wait_for_signal().await;
    let closed = close_all_sessions(&kernel).await;
    info!(signal, sessions = closed, "shut down sessions");
}

async fn close_all_sessions(kernel: &Kernel) -> usize {
    let closed = kernel
        .sessions()
        .iter()
        .filter(|session_id| kernel.close_session(session_id))
        .count();
    kernel.flush().await;
    closed
}

async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(error) => {
                warn!(%error, "SIGTERM handler unavailable");
                return ctrl_c().await;
            }
        };
        tokio::select! {
            name = ctrl_c() => name,
            _ = terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> &'static str {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn app_state() -> AppState {
        AppState {
            kernel: KernelBuilder::new(KernelConfig::default()).build(),
        }
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let state = app_state().await;
        let error = rpc(
            Path("missing".to_owned()),
            State(state),
            Json(json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" })),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn created_sessions_get_a_grid_backend_and_answer_rpc() -> anyhow::Result<()> {
        let state = app_state().await;
        let (status, Json(created)) = create_session(State(state.clone()), None)
            .await
            .map_err(|error| anyhow::anyhow!(error.message))?;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.capabilities.len(), 10);

        let response = rpc(
            Path(created.session_id.to_string()),
            State(state.clone()),
            Json(json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" })),
        )
        .await
        .map_err(|error| anyhow::anyhow!(error.message))?;
        assert_eq!(response.status(), StatusCode::OK);

        let notification = rpc(
            Path(created.session_id.to_string()),
            State(state),
            Json(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })),
        )
        .await
        .map_err(|error| anyhow::anyhow!(error.message))?;
        assert_eq!(notification.status(), StatusCode::ACCEPTED);
        Ok(())
    }

    #[tokio::test]
    async fn resolving_unknown_approval_is_not_found() -> anyhow::Result<()> {
        let state = app_state().await;
        let (_, Json(created)) = create_session(State(state.clone()), None)
            .await
            .map_err(|error| anyhow::anyhow!(error.message))?;
        let error = resolve_approval(
            Path((created.session_id.to_string(), "nope".to_owned())),
            State(state),
            Json(ResolveApprovalRequest {
                approved: true,
                payload: None,
                reason: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() -> anyhow::Result<()> {
        let state = app_state().await;
        for _ in 0..2 {
            let _ = create_session(State(state.clone()), None)
                .await
                .map_err(|error| anyhow::anyhow!(error.message))?;
        }
        assert_eq!(close_all_sessions(&state.kernel).await, 2);
        assert!(state.kernel.sessions().is_empty());
        assert_eq!(close_all_sessions(&state.kernel).await, 0);
        Ok(())
    }
}
