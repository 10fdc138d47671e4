//! Control API: proxy-manager dispatch, reviews and live sessions

use anyhow::Context;
use axum::{
    Router,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use relaygate_core::dispatcher::{ClientRequest, ClientState, DispatchError};
use relaygate_core::index::{MAX_SEARCH_LIMIT, SessionHit};
use relaygate_core::plugins::review::ReviewError;
use relaygate_core::plugins::{Review, ReviewDecision};

use crate::auth::constant_time_eq;
use crate::server::{GatewayServer, GatewayState};
use crate::sessions::SessionSummary;

type ApiError = (StatusCode, String);

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewQuery {
    pub group: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub org: String,
    pub q: String,
    /// Only sessions of this user
    pub user: Option<String>,
    pub limit: Option<usize>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    let api = Router::new()
        .route("/proxymanager/connect", post(proxy_connect))
        .route("/proxymanager/disconnect", post(proxy_disconnect))
        .route("/proxymanager/status/{id}", get(proxy_status))
        .route("/reviews", get(list_reviews))
        .route("/reviews/{session_id}/approve", post(approve_review))
        .route("/reviews/{session_id}/reject", post(reject_review))
        .route("/sessions", get(list_sessions))
        .route("/sessions/search", get(search_sessions))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer check against the configured control token; an empty token disables it
async fn require_token(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = &state.settings.control_token;
    if expected.is_empty() {
        return Ok(next.run(req).await);
    }
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        return Err((StatusCode::UNAUTHORIZED, "invalid authentication".to_string()));
    }
    Ok(next.run(req).await)
}

fn dispatch_status(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::ForceReconnect => StatusCode::CONFLICT,
        DispatchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::StreamGone => StatusCode::BAD_GATEWAY,
        DispatchError::OpenFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn review_status(err: &ReviewError) -> StatusCode {
    match err {
        ReviewError::NotFound(_) => StatusCode::NOT_FOUND,
        ReviewError::AlreadyDecided { .. } => StatusCode::CONFLICT,
        ReviewError::NotReviewer(_) => StatusCode::FORBIDDEN,
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn proxy_connect(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<ClientRequest>,
) -> Result<Json<ConnectResponse>, ApiError> {
    if req.id.is_empty() || req.connection_name.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "id and connection_name are required".to_string(),
        ));
    }
    match state.dispatcher.open_session(req).await {
        Ok(None) => Ok(Json(ConnectResponse {
            status: "connected".to_string(),
            payload: None,
        })),
        Ok(Some(pkt)) => Ok(Json(ConnectResponse {
            status: "waiting-approval".to_string(),
            payload: Some(String::from_utf8_lossy(&pkt.payload).into_owned()),
        })),
        Err(e) => {
            warn!("proxymanager connect failed: {}", e);
            Err((dispatch_status(&e), e.to_string()))
        }
    }
}

async fn proxy_disconnect(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<ClientRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .dispatcher
        .disconnect(&req)
        .map_err(|e| (dispatch_status(&e), e.to_string()))?;
    Ok(StatusCode::ACCEPTED)
}

async fn proxy_status(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<ClientState>, ApiError> {
    state
        .dispatcher
        .status(&id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("proxy manager {} not found", id)))
}

async fn list_reviews(State(state): State<Arc<GatewayState>>) -> Json<Vec<Review>> {
    Json(state.reviews.pending().await)
}

async fn decide(
    state: &GatewayState,
    session_id: &str,
    group: Option<&str>,
    decision: ReviewDecision,
) -> Result<Json<Review>, ApiError> {
    let review = state
        .decide_review(session_id, group, decision)
        .await
        .map_err(|e| (review_status(&e), e.to_string()))?;
    info!(
        "review {} for session {} is now {:?}",
        review.id, session_id, review.status
    );
    Ok(Json(review))
}

async fn approve_review(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<Review>, ApiError> {
    decide(&state, &session_id, query.group.as_deref(), ReviewDecision::Approve).await
}

async fn reject_review(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<Review>, ApiError> {
    decide(&state, &session_id, query.group.as_deref(), ReviewDecision::Reject).await
}

async fn list_sessions(State(state): State<Arc<GatewayState>>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.summaries())
}

async fn search_sessions(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SessionHit>>, ApiError> {
    if query.org.is_empty() || query.q.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "org and q are required".to_string()));
    }
    info!("org={} user={:?} query=[{}] searching", query.org, query.user, query.q);
    let index = state.index.clone();
    let limit = query.limit.unwrap_or(MAX_SEARCH_LIMIT);
    let hits = tokio::task::spawn_blocking(move || {
        index.search(&query.org, &query.q, query.user.as_deref(), limit)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| (StatusCode::BAD_REQUEST, format!("{e:#}")))?;
    Ok(Json(hits))
}

impl GatewayServer {
    pub async fn bind_control(&self) -> anyhow::Result<TcpListener> {
        let addr = &self.state().settings.control_addr;
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind control listener on {}", addr))
    }

    /// Serve the control API until shutdown
    pub async fn serve_control(&self, listener: TcpListener) -> anyhow::Result<()> {
        let state = self.state();
        let shutdown = state.shutdown.clone();
        info!("Control API listening on {}", listener.local_addr()?);
        axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        Ok(())
    }
}
