//! Axum-based HTTP API over the running devices

use crate::config::Config;
use crate::error::VoltaicError;
use crate::runtime::RuntimeHandle;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub runtime: RuntimeHandle,
    pub config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
pub struct WriteBody {
    pub value: serde_json::Value,
}

/// Error response carrying the status derived from the error kind
pub struct ApiError(VoltaicError);

impl From<VoltaicError> for ApiError {
    fn from(error: VoltaicError) -> Self {
        Self(error)
    }
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self.0 {
            VoltaicError::AccessMode { .. } => StatusCode::FORBIDDEN,
            VoltaicError::NotFound { .. } => StatusCode::NOT_FOUND,
            VoltaicError::Conversion { .. } | VoltaicError::Validation { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let json = serde_json::to_value(state.config.as_ref())
        .unwrap_or_else(|_| serde_json::json!({"error":"serialization"}));
    Json(json)
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mut devices = Vec::new();
    for id in state.runtime.device_ids() {
        match state.runtime.device_status(&id).await {
            Ok(status) => devices.push(serde_json::json!({
                "id": status.id,
                "kind": status.kind,
                "state": status.state,
                "state_machine": status.state_machine,
                "ready_for_working": status.ready_for_working,
            })),
            // removed between listing and lookup
            Err(VoltaicError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Json(serde_json::json!({ "devices": devices })))
}

async fn device_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.runtime.device_status(&id).await?;
    Ok(Json(serde_json::to_value(status).map_err(VoltaicError::from)?))
}

async fn device_channels(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.runtime.channels(&id)?.snapshot()))
}

async fn read_channel(
    State(state): State<AppState>,
    Path((id, channel)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let value = state.runtime.get_value(&id, &channel)?;
    Ok(Json(serde_json::json!({ "value": value })))
}

async fn write_channel(
    State(state): State<AppState>,
    Path((id, channel)): Path<(String, String)>,
    Json(body): Json<WriteBody>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .runtime
        .set_next_write_json(&id, &channel, &body.value)?;
    Ok((StatusCode::OK, Json(serde_json::json!({"ok":true}))))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}", get(device_status))
        .route("/api/devices/{id}/channels", get(device_channels))
        .route(
            "/api/devices/{id}/channels/{channel}",
            get(read_channel).post(write_channel),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(runtime: RuntimeHandle, config: Arc<Config>) -> anyhow::Result<()> {
    let host = config.web.host.clone();
    let port = config.web.port;
    let router = build_router(AppState { runtime, config });

    let logger = crate::logging::get_logger("web");
    logger.info(&format!(
        "Starting web server; requested host={}, port={}",
        host, port
    ));

    let addr = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            logger.warn(&format!("Invalid host '{}'; falling back to 127.0.0.1", host));
            ([127, 0, 0, 1], port).into()
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    logger.info(&format!(
        "Web server listening at http://{}:{} (API /api)",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router).await?;
    Ok(())
}
