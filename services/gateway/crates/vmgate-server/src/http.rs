//! HTTP surface: the operation endpoint plus health, docs and audit views.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use vmgate_common::Operation;

use crate::executor::{Completion, OperationRequest, Outcome};
use crate::state::AppState;

/// Reconnect delay advertised to SSE clients.
const SSE_RETRY: Duration = Duration::from_millis(1000);

const DEFAULT_RECENT_LIMIT: usize = 10;
const MAX_RECENT_LIMIT: usize = 500;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/gcp-action/", get(gcp_action))
        .route("/gcp-action", get(gcp_action))
        .route("/health", get(health))
        .route("/api-docs", get(api_docs))
        .route("/operations/recent", get(recent_operations))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Client identity ─────────────────────────────────────────────────────────

/// First `X-Forwarded-For` hop, else the peer address, else `unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return Ok(Self(ip.to_string()));
        }
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(Self(addr.ip().to_string()));
        }
        Ok(Self("unknown".to_string()))
    }
}

// ── Operation endpoint ──────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Sse,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct ActionQuery {
    pub vmname: String,
    pub operation: Option<String>,
    pub zone: Option<String>,
    #[serde(default)]
    pub format: ResponseFormat,
}

async fn gcp_action(
    State(state): State<Arc<AppState>>,
    ClientIdentity(client): ClientIdentity,
    Query(query): Query<ActionQuery>,
) -> Response {
    let operation = match query
        .operation
        .as_deref()
        .unwrap_or(Operation::Status.as_str())
        .parse::<Operation>()
    {
        Ok(op) => op,
        Err(e) => {
            tracing::info!(client = %client, error = %e, "rejected request");
            return error_body(StatusCode::BAD_REQUEST, &e.to_string(), None);
        }
    };
    let request = OperationRequest {
        vm: query.vmname,
        operation,
        zone: query.zone.filter(|z| !z.trim().is_empty()),
        client,
    };

    match query.format {
        ResponseFormat::Sse => {
            let events = state.executor.stream(request).map(|event| {
                Ok::<_, Infallible>(
                    SseEvent::default()
                        .event(event.kind.as_str())
                        .data(event.payload)
                        .retry(SSE_RETRY),
                )
            });
            Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        ResponseFormat::Json => json_outcome(state.executor.execute(request).await),
    }
}

fn json_outcome(outcome: Outcome) -> Response {
    let alias = outcome.display_alias;
    match outcome.result {
        Ok(Completion::Status(status)) => Json(json!({
            "status": "success",
            "data": status,
            "display_alias": alias,
        }))
        .into_response(),
        Ok(completion) => Json(json!({
            "status": "success",
            "message": completion.message(),
            "display_alias": alias,
        }))
        .into_response(),
        Err(err) => {
            let code = StatusCode::from_u16(err.class().http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_body(code, &err.client_message(), Some(&alias))
        }
    }
}

fn error_body(code: StatusCode, message: &str, alias: Option<&str>) -> Response {
    let mut body = json!({ "status": "error", "message": message });
    if let Some(alias) = alias {
        body["display_alias"] = Value::from(alias);
    }
    (code, Json(body)).into_response()
}

// ── Health, docs, audit ─────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let policy = state.executor.policy();
    let operations: Vec<Value> = Operation::ALL
        .iter()
        .map(|op| {
            let restricted = policy.is_restricted(*op);
            let scope = if restricted {
                "allow-listed VMs only"
            } else {
                "all VMs"
            };
            json!({ "name": op, "restricted": restricted, "note": scope })
        })
        .collect();
    Json(json!({
        "status": "healthy",
        "cache_status": state.directory.status(),
        "supported_operations": operations,
        "allowed_vms": policy.allowed_with_aliases(state.executor.names()),
        "server_version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

async fn api_docs() -> Json<Value> {
    Json(json!({
        "endpoints": {
            "/gcp-action/": {
                "method": "GET",
                "description": "Run a lifecycle operation on a VM",
                "parameters": {
                    "vmname": "VM name, vanity name or host name (required)",
                    "operation": "status | start | stop | suspend | resume (default: status)",
                    "zone": "zone of the VM (optional; looked up when omitted)",
                    "format": "sse | json (default: sse)",
                },
                "sse_events": ["info", "progress", "status", "success", "error", "denied"],
            },
            "/health": {
                "method": "GET",
                "description": "Directory cache status, supported operations and allow-list",
            },
            "/operations/recent": {
                "method": "GET",
                "description": "Most recent audit rows, newest first",
                "parameters": { "limit": "row count (default 10, max 500)" },
            },
            "/api-docs": {
                "method": "GET",
                "description": "This document",
            },
        }
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

async fn recent_operations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);
    match state.audit.recent(limit).await {
        Ok(rows) => Json(json!({ "count": rows.len(), "operations": rows })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read audit log");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not read the audit log.",
                None,
            )
        }
    }
}
