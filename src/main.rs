use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::AppConfig;
use crate::hls::HlsManager;
use crate::net::rtmp::RtmpServer;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::registry::ConnectionRegistry;
use crate::state::StateStore;

mod broadcast;
mod config;
mod error;
mod hls;
mod net;
mod pipeline;
mod protocol;
mod registry;
mod state;
mod telemetry;
mod web;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eprintln!("🚀 Starting camera bridge...");

    let config = AppConfig::load()?;
    telemetry::init_telemetry(&config.log_level);
    info!(
        devices = config.devices.len(),
        rtmp = config.rtmp.enabled,
        hls = config.hls.enabled,
        http = config.http.enabled,
        "⚙️ Configuration loaded"
    );

    let store = Arc::new(StateStore::new());
    store.set_history_callback(pipeline::history_sink);

    let broadcaster = Arc::new(Broadcaster::new(config.rtmp.subscriber_queue));
    let hls_dir = config.hls_dir();
    let hls = Arc::new(HlsManager::new(&hls_dir, config.hls.transcode_settings()));
    let registry = Arc::new(ConnectionRegistry::new());

    let shutdown = CancellationToken::new();

    if config.rtmp.enabled {
        let addr = config.rtmp_listen_addr()?;
        let server = Arc::new(RtmpServer::new(broadcaster.clone(), store.clone()));
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = server.run(addr, cancel).await {
                error!("RTMP server failed: {}", e);
            }
        });
    } else {
        warn!("RTMP relay disabled, devices will not be asked to stream");
    }

    if config.hls.enabled {
        if let Err(e) = std::fs::create_dir_all(&hls_dir) {
            warn!(dir = %hls_dir.display(), error = %e, "Failed to create HLS directory");
        }
        let cleanup = hls.clone();
        tokio::spawn(cleanup.run_cleanup(
            Duration::from_secs(config.hls.cleanup_interval_secs.max(1)),
            Duration::from_secs(config.hls.orphan_max_age_secs),
            shutdown.child_token(),
        ));
    }

    if config.http.enabled {
        let web_state = web::WebServerState {
            store: store.clone(),
            hls: hls.clone(),
            registry: registry.clone(),
            devices: config.devices.iter().map(|d| d.uid.clone()).collect(),
        };
        let port = config.http.port;
        tokio::spawn(async move {
            if let Err(e) = web::start_web_server(port, web_state).await {
                error!("Web server failed: {}", e);
            }
        });
    }

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        hls.clone(),
        registry.clone(),
        PipelineOptions::from_config(&config),
    ));

    let mut device_tasks = Vec::with_capacity(config.devices.len());
    for device in &config.devices {
        let url = config.websocket.url_for(&device.camera_uid);
        let task = pipeline
            .clone()
            .run_device(device.clone(), url, shutdown.child_token());
        device_tasks.push(tokio::spawn(task));
    }
    if device_tasks.is_empty() {
        warn!("No devices configured");
    }

    info!("🔧 All tasks started, waiting for shutdown signal");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("🛑 Shutting down");
    shutdown.cancel();
    for task in device_tasks {
        if let Err(e) = task.await {
            warn!("Device task ended abnormally: {}", e);
        }
    }
    hls.stop_all().await;

    info!("🛑 Shutdown complete");
    Ok(())
}
