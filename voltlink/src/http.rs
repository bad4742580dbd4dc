//! HTTP control façade and WebSocket endpoint.

use std::sync::Arc;

use axum::Router;
use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;
use voltlink_common::{Command, CommandSink, CommandValue};
use voltlink_hub::{Hub, ws_handler};
use voltlink_modbus::DevicePoller;

use crate::error::{RelayError, Result};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub poller: DevicePoller,
    pub sink: Arc<dyn CommandSink>,
    pub hub: Arc<Hub>,
}

impl FromRef<AppState> for Arc<Hub> {
    fn from_ref(state: &AppState) -> Self {
        state.hub.clone()
    }
}

/// Create the HTTP router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(devices_handler))
        .route("/api/data", get(data_handler))
        .route("/api/command", post(command_handler))
        .route("/api/system/control", post(system_control_handler))
        .route("/api/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn devices_handler(State(state): State<AppState>) -> Response {
    Json(state.poller.devices()).into_response()
}

/// Reads every connected device now. Devices without a connection are
/// left out.
async fn data_handler(State(state): State<AppState>) -> Response {
    Json(state.poller.read_all_devices().await).into_response()
}

async fn command_handler(
    State(state): State<AppState>,
    Json(command): Json<Command>,
) -> Response {
    if !command.is_complete() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "deviceId and command are required" })),
        )
            .into_response();
    }

    if state.sink.publish(&command).await {
        Json(json!({ "success": true, "message": "Command sent successfully" })).into_response()
    } else {
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "Failed to send command" })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SystemControlRequest {
    #[serde(default)]
    control: String,
    #[serde(default)]
    value: Option<CommandValue>,
}

async fn system_control_handler(
    State(state): State<AppState>,
    Json(request): Json<SystemControlRequest>,
) -> Response {
    if request.control.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "control parameter is required" })),
        )
            .into_response();
    }

    let command = Command::system(request.control, request.value);
    if state.sink.publish(&command).await {
        Json(json!({ "success": true, "message": "System control updated" })).into_response()
    } else {
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "Failed to update system control" })),
        )
            .into_response()
    }
}

async fn status_handler(State(state): State<AppState>) -> Response {
    Json(json!({
        "modbus": {
            "devices": state.poller.devices().len(),
            "connected": state.poller.connected_devices(),
            "polling": state.poller.is_polling(),
            "stats": state.poller.stats(),
        },
        "mqtt": {
            "connected": state.sink.is_connected(),
        },
        "viewers": state.hub.viewer_count(),
        "timestamp": voltlink_common::now(),
    }))
    .into_response()
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Serve `router` on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("HTTP server shutting down");
        })
        .await
        .map_err(|e| RelayError::Server(e.to_string()))?;

    info!("HTTP server stopped");
    Ok(())
}
