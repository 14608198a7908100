// Optional local HTTP surface: health, activation lookup, per-owner SSE event
// streams, and JSON-RPC over POST for clients that cannot reach the socket.

use std::convert::Infallible;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use berth_common::protocol::events::RoutedEvent;
use berth_common::types::SessionId;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::HubError;
use crate::rpc::methods::{handle_raw_request, RpcServerState};

pub fn router(state: RpcServerState) -> Router {
    Router::new()
        .route("/health", get(health_route))
        .route("/rpc", post(rpc_route))
        .route("/sessions/{session_id}/activation", get(activation_route))
        .route("/sessions/{session_id}/events", get(events_route))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: RpcServerState) -> Result<()> {
    axum::serve(listener, router(state)).await.context("daemon http server failed")
}

async fn health_route() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn rpc_route(State(state): State<RpcServerState>, body: Bytes) -> impl IntoResponse {
    Json(handle_raw_request(&body, &state).await)
}

async fn activation_route(
    State(state): State<RpcServerState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let activation = state.hub().get_session_activation(&SessionId::from(session_id));
    Json(json!({ "activation": activation }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    owner_id: String,
}

async fn events_route(
    State(state): State<RpcServerState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let session_id = SessionId::from(session_id);
    match state.hub().subscribe_events(&session_id, &query.owner_id).await {
        Ok(handle) => {
            debug!(session_id = %session_id, owner_id = %query.owner_id, "sse subscriber attached");
            Sse::new(sse_events(handle.into_stream())).keep_alive(KeepAlive::default()).into_response()
        }
        Err(error) => error_response(&error),
    }
}

fn sse_events(
    events: impl Stream<Item = RoutedEvent> + Send + 'static,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    events.map(|routed| {
        let mut event = Event::default().event(routed.event_name.clone()).data(routed.payload.to_string());
        if let Some(id) = routed.id {
            event = event.id(id);
        }
        Ok(event)
    })
}

fn error_response(error: &HubError) -> Response {
    let status = match error {
        HubError::NotClaimed { .. } | HubError::UnknownTask(_) => StatusCode::NOT_FOUND,
        HubError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        HubError::SingletonConflict { .. } | HubError::MigrationConflict { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({ "error": { "code": error.code(), "message": error.to_string() } });
    (status, Json(body)).into_response()
}
