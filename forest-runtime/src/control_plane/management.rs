//! The loopback management HTTP API.
//!
//! No auth by design: bind it to loopback. JSON bodies throughout; errors
//! are `{code, message}` with 4xx for validation, 409 for name conflicts,
//! and 500 for runtime failures.

use crate::control_plane::config::load_config;
use crate::control_plane::descriptor::{ComponentDescriptor, ComponentKind};
use crate::control_plane::supervisor::Supervisor;
use crate::status::{ErrorKind, ForestError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const MANAGEMENT_TAG: &str = "ManagementApi:";

struct ManagementState {
    supervisor: Arc<Supervisor>,
    config_path: Option<PathBuf>,
}

/// Builds the management router over a running supervisor. `config_path`
/// backs `POST /-/reload`; without one, reload is refused.
pub fn management_router(supervisor: Arc<Supervisor>, config_path: Option<PathBuf>) -> Router {
    let state = Arc::new(ManagementState {
        supervisor,
        config_path,
    });
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/:kind", get(list).post(add))
        .route("/api/v1/:kind/:name", axum::routing::delete(remove))
        .route("/-/reload", post(reload))
        .with_state(state)
}

fn error_response(err: &ForestError) -> Response {
    let status = match err.kind() {
        ErrorKind::ConfigInvalid | ErrorKind::ArtifactNotFound | ErrorKind::Script => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::NameConflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"code": err.kind().code(), "message": err.message()})),
    )
        .into_response()
}

fn unknown_kind(kind: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "code": ErrorKind::NotFound.code(),
            "message": format!("unknown component kind {kind:?}"),
        })),
    )
        .into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn status(State(state): State<Arc<ManagementState>>) -> Json<serde_json::Value> {
    let mut body = json!({
        "running": state.supervisor.is_running(),
    });
    for kind in [
        ComponentKind::Tree,
        ComponentKind::TreeHouse,
        ComponentKind::Nim,
        ComponentKind::Source,
    ] {
        let rows: Vec<serde_json::Value> = state
            .supervisor
            .status()
            .into_iter()
            .filter(|row| row.kind == kind)
            .map(|row| serde_json::to_value(row).unwrap_or(serde_json::Value::Null))
            .collect();
        body[kind.collection()] = serde_json::Value::Array(rows);
    }
    Json(body)
}

async fn list(
    State(state): State<Arc<ManagementState>>,
    Path(kind): Path<String>,
) -> Response {
    let Some(kind) = ComponentKind::from_collection(&kind) else {
        return unknown_kind(&kind);
    };
    let descriptors: Vec<serde_json::Value> = state
        .supervisor
        .descriptors(kind)
        .await
        .into_iter()
        .map(|descriptor| {
            let mut value = descriptor.spec.to_value();
            if let Some(object) = value.as_object_mut() {
                object.insert("name".to_string(), json!(descriptor.name));
            }
            value
        })
        .collect();
    Json(descriptors).into_response()
}

async fn add(
    State(state): State<Arc<ManagementState>>,
    Path(kind): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let Some(kind) = ComponentKind::from_collection(&kind) else {
        return unknown_kind(&kind);
    };
    let descriptor = match ComponentDescriptor::from_api(kind, body) {
        Ok(descriptor) => descriptor,
        Err(err) => return error_response(&err),
    };
    let name = descriptor.name.clone();
    match state.supervisor.add(descriptor).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({"name": name}))).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn remove(
    State(state): State<Arc<ManagementState>>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let Some(kind) = ComponentKind::from_collection(&kind) else {
        return unknown_kind(&kind);
    };
    match state.supervisor.remove(kind, &name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn reload(State(state): State<Arc<ManagementState>>) -> Response {
    let Some(config_path) = &state.config_path else {
        let err = ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            "no config file attached to this node",
        );
        return error_response(&err);
    };
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            warn!("{MANAGEMENT_TAG} reload rejected: {err}");
            return error_response(&err);
        }
    };
    match state.supervisor.reload(&config).await {
        Ok(outcome) => Json(json!({
            "added": outcome.added,
            "removed": outcome.removed,
            "changed": outcome.changed,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}
