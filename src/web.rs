use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

use crate::hls::{HlsManager, PlaybackStatus, TranscoderInfo};
use crate::registry::ConnectionRegistry;
use crate::state::{is_valid_uid, StateStore, StateView};

pub struct WebServerState {
    pub store: Arc<StateStore>,
    pub hls: Arc<HlsManager>,
    pub registry: Arc<ConnectionRegistry>,
    /// Configured device UIDs, in config order
    pub devices: Vec<String>,
}

#[derive(Serialize)]
pub struct DeviceSummary {
    pub uid: String,
    pub connected: bool,
    pub state: StateView,
}

#[derive(Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceSummary>,
    pub total_count: usize,
}

#[derive(Serialize)]
pub struct HlsStatusResponse {
    pub uid: String,
    pub playback: PlaybackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcoder: Option<TranscoderInfo>,
}

/// Read-only status API plus the HLS output directory.
pub fn create_web_router(state: WebServerState) -> Router {
    let hls_files = ServeDir::new(state.hls.base_dir());
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:uid/state", get(get_device_state))
        .route("/api/devices/:uid/hls", get(get_hls_status))
        .nest_service("/hls", hls_files)
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn start_web_server(port: u16, state: WebServerState) -> anyhow::Result<()> {
    let app = create_web_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("🌐 Web server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

fn known_device(state: &WebServerState, uid: &str) -> bool {
    is_valid_uid(uid) && state.devices.iter().any(|d| d == uid)
}

async fn list_devices(State(state): State<Arc<WebServerState>>) -> Json<DeviceListResponse> {
    let devices: Vec<DeviceSummary> = state
        .devices
        .iter()
        .map(|uid| DeviceSummary {
            uid: uid.clone(),
            connected: state.registry.is_connected(uid),
            state: state.store.get(uid).view(),
        })
        .collect();
    let total_count = devices.len();
    Json(DeviceListResponse { devices, total_count })
}

async fn get_device_state(
    State(state): State<Arc<WebServerState>>,
    Path(uid): Path<String>,
) -> impl IntoResponse {
    if !known_device(&state, &uid) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(state.store.get(&uid).view()))
}

async fn get_hls_status(
    State(state): State<Arc<WebServerState>>,
    Path(uid): Path<String>,
) -> impl IntoResponse {
    if !known_device(&state, &uid) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(HlsStatusResponse {
        playback: state.hls.playback(&uid),
        transcoder: state.hls.info(&uid),
        uid,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::TranscodeSettings;
    use crate::state::{State as DeviceState, StreamState};

    fn test_state(dir: &std::path::Path) -> Arc<WebServerState> {
        Arc::new(WebServerState {
            store: Arc::new(StateStore::new()),
            hls: Arc::new(HlsManager::new(dir, TranscodeSettings::default())),
            registry: Arc::new(ConnectionRegistry::new()),
            devices: vec!["nursery".to_string()],
        })
    }

    #[tokio::test]
    async fn test_list_devices_reports_configured_uids() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state.store.update(
            "nursery",
            DeviceState::new().with_stream_state(StreamState::Alive).with_temperature_milli(21500),
        );

        let Json(body) = list_devices(State(state)).await;
        assert_eq!(body.total_count, 1);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["devices"][0]["uid"], "nursery");
        assert_eq!(json["devices"][0]["connected"], false);
        assert_eq!(json["devices"][0]["state"]["stream_state"], "alive");
        assert_eq!(json["devices"][0]["state"]["temperature"], 21.5);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let response = get_device_state(State(state.clone()), Path("other".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = get_hls_status(State(state), Path("../etc".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hls_status_inactive_without_transcoder() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let response = get_hls_status(State(state), Path("nursery".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
