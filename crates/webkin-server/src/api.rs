//! HTTP and WebSocket surface.
//!
//! REST handlers are thin: parse the body, call one coordinator method
//! (which takes the scene lock, mutates, recomputes, and broadcasts), and
//! return a small JSON status. WebSocket clients register an outbound queue
//! with the coordinator, receive `scene_init`, and may push `joint_update`
//! messages that are treated exactly like transport joint updates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tower_http::services::{ServeDir, ServeFile};
use tracing::debug;

use webkin_bundle::K3dBundle;
use webkin_kinematics::AxisOverride;
use webkin_types::WebkinError;

use crate::coordinator::Coordinator;

/// Shared application context passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub bundle: Option<Arc<K3dBundle>>,
    pub static_dir: PathBuf,
}

/// Build the full router: REST surface, WebSocket, bundle models, and
/// static assets.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/tree", get(get_tree).post(post_tree))
        .route("/api/scene", get(get_scene))
        .route("/api/joints", post(post_joints))
        .route("/api/offset/set_zero", post(post_set_zero))
        .route("/api/axis/override", post(post_axis_override))
        .route(
            "/api/axis/overrides",
            get(get_overrides).delete(delete_overrides),
        )
        .route("/api/axis/overrides/{name}", delete(delete_override))
        .route("/k3d/models/{file}", get(get_model))
        .route_service("/", ServeFile::new(state.static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(state.static_dir.clone()))
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn error_response(err: WebkinError) -> ApiError {
    let status = match &err {
        WebkinError::UnknownJoint(_) => StatusCode::NOT_FOUND,
        WebkinError::MalformedTree(_) | WebkinError::DuplicateName(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()})))
}

fn missing_field(name: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": format!("{name} required")})),
    )
}

// ── REST handlers ───────────────────────────────────────────────────────────

async fn get_tree(State(state): State<AppState>) -> Json<Value> {
    match state.coordinator.tree_doc() {
        Some(doc) => Json(doc),
        None => Json(json!({"error": "No tree loaded"})),
    }
}

async fn post_tree(
    State(state): State<AppState>,
    Json(doc): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let joints = state.coordinator.load_tree(doc).map_err(error_response)?;
    Ok(Json(json!({"status": "ok", "joints": joints})))
}

async fn get_scene(State(state): State<AppState>) -> Json<Value> {
    Json(state.coordinator.scene_json())
}

async fn post_joints(
    State(state): State<AppState>,
    Json(coords): Json<HashMap<String, f64>>,
) -> Json<Value> {
    state.coordinator.set_joint_coords(&coords);
    Json(json!({"status": "ok"}))
}

async fn post_set_zero(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let name = body
        .get("joint_name")
        .and_then(Value::as_str)
        .ok_or_else(|| missing_field("joint_name"))?;
    let offset = state.coordinator.set_zero(name).map_err(error_response)?;
    Ok(Json(json!({
        "status": "ok",
        "joint_name": name,
        "axis_offset": offset,
    })))
}

async fn post_axis_override(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let name = body
        .get("joint_name")
        .and_then(Value::as_str)
        .ok_or_else(|| missing_field("joint_name"))?;
    let field = |key: &str| body.get(key).and_then(Value::as_f64);
    let patch = AxisOverride {
        axis_offset: field("axis_offset"),
        axis_scale: field("axis_scale"),
        slider_min: field("slider_min"),
        slider_max: field("slider_max"),
    };
    state
        .coordinator
        .set_override(name, patch)
        .map_err(error_response)?;
    Ok(Json(json!({"status": "ok", "joint_name": name})))
}

async fn get_overrides(State(state): State<AppState>) -> Json<Value> {
    Json(state.coordinator.overrides_json())
}

async fn delete_overrides(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.coordinator.clear_overrides().map_err(error_response)?;
    Ok(Json(json!({"status": "ok"})))
}

async fn delete_override(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .coordinator
        .clear_override(&name)
        .map_err(error_response)?;
    Ok(Json(json!({"status": "ok", "joint_name": name})))
}

async fn get_model(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let not_found = |msg: &str| (StatusCode::NOT_FOUND, Json(json!({"error": msg})));
    let bundle = state
        .bundle
        .as_ref()
        .ok_or_else(|| not_found("No K3D bundle loaded"))?;
    let path = bundle
        .model_path(&file)
        .ok_or_else(|| not_found(&format!("Model not found: {file}")))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| not_found("Failed to read model"))?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

// ── WebSocket ───────────────────────────────────────────────────────────────

async fn ws_handler(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    let coordinator = Arc::clone(&state.coordinator);
    upgrade.on_upgrade(move |socket| handle_socket(socket, coordinator))
}

/// Per-client bridge: fan-out queue → socket, socket → coordinator.
async fn handle_socket(socket: WebSocket, coordinator: Arc<Coordinator>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let client_id = coordinator.register_client(tx);
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(text.as_str(), &coordinator);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    coordinator.unregister_client(client_id);
}

/// Parse an inbound client message; only `joint_update` is recognised, and
/// anything undecodable is dropped.
fn handle_client_message(text: &str, coordinator: &Coordinator) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        debug!("dropping undecodable client message");
        return;
    };
    if value.get("type").and_then(Value::as_str) != Some("joint_update") {
        return;
    }
    if let Some(map) = value.get("joints").and_then(Value::as_object) {
        let coords: HashMap<String, f64> = map
            .iter()
            .map(|(k, v)| (k.clone(), v.as_f64().unwrap_or(0.0)))
            .collect();
        if !coords.is_empty() {
            coordinator.set_joint_coords(&coords);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
