use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize telemetry. `RUST_LOG` wins over the configured level.
pub fn init_telemetry(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,camera_bridge={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!(level = %level, "📊 Telemetry initialized");
}
