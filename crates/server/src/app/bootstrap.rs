use std::backtrace::Backtrace;
use std::sync::Arc;

use engine::config::{resolve_server_config, ConfigError, ServerConfig, CONFIG_ENV_VAR};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub(crate) fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

/// Routes panic reports through tracing so a contained dispatch fault is logged with its stack.
pub(crate) fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        error!(panic = %info, backtrace = %backtrace, "panic_captured");
    }));
}

pub(crate) fn load_config() -> Result<Arc<ServerConfig>, ConfigError> {
    let config = resolve_server_config()?;
    info!(
        source = %std::env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| "<defaults>".to_string()),
        base_ms = config.tick.base_ms,
        scenes = config.scenes.len(),
        ai_scene = config.ai_world.scene_id,
        "config_loaded"
    );
    Ok(Arc::new(config))
}
