//! HTTP surface: `/api/<protocol>/<action>` plus health and discovery routes

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::debug;
use wireprobe_core::{Envelope, Error, RawRequest, Result};
use wireprobe_network::{dispatch, Protocol, ProbeContext};

#[derive(Clone)]
pub struct AppState {
    ctx: Arc<ProbeContext>,
}

/// Build the service router around a shared probe context
pub fn router(ctx: ProbeContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/protocols", get(list_protocols))
        .route("/api/:protocol/:action", any(probe))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { ctx: Arc::new(ctx) })
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolInfo {
    key: &'static str,
    default_port: Option<u16>,
    actions: &'static [&'static str],
}

async fn list_protocols() -> Json<Value> {
    let protocols: Vec<ProtocolInfo> = Protocol::ALL
        .iter()
        .map(|p| ProtocolInfo {
            key: p.key(),
            default_port: p.default_port(),
            actions: p.actions(),
        })
        .collect();
    Json(json!({ "protocols": protocols }))
}

async fn probe(
    State(state): State<AppState>,
    method: Method,
    Path((protocol, action)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some(protocol) = Protocol::from_key(&protocol) else {
        let known: Vec<&str> = Protocol::ALL.iter().map(|p| p.key()).collect();
        return respond(Envelope::with_status(
            format!("Unknown protocol '{}'. Supported: {}", protocol, known.join(", ")),
            404,
        ));
    };
    let action = action.to_ascii_lowercase();
    let known_action = protocol.actions().contains(&action.as_str());

    let raw = match method {
        Method::POST => match parse_body(&body) {
            Ok(raw) => raw,
            Err(e) => return respond(Envelope::from_error(&e)),
        },
        Method::GET if !known_action || protocol.allows_get(&action) => {
            RawRequest::from_query(query)
        }
        _ => {
            return respond(Envelope::with_status(
                format!("Method {} not allowed for {}/{}; use POST", method, protocol, action),
                405,
            ))
        }
    };

    debug!("{} /api/{}/{}", method, protocol, action);
    respond(dispatch(protocol, &action, &raw, &state.ctx).await)
}

/// An empty body is an empty request; anything else must be a JSON object
fn parse_body(body: &[u8]) -> Result<RawRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RawRequest::new());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidBody(e.to_string()))?;
    RawRequest::from_json(value)
}

fn respond(envelope: Envelope) -> Response {
    let status = StatusCode::from_u16(envelope.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope.to_json())).into_response()
}
