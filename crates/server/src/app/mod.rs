mod bootstrap;
mod bots;
mod outbound;

use std::io;
use std::sync::Arc;

use engine::config::ConfigError;
use engine::dispatch::{dispatch_queues, Dispatcher, DispatcherError, QueueClosed};
use engine::tick::{Supervisor, SupervisorError};
use thiserror::Error;
use tracing::{info, warn};

use bots::{BotConfig, BotDirector};

#[derive(Debug, Error)]
pub(crate) enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Queue(#[from] QueueClosed),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

pub(crate) fn run() -> Result<(), ServerError> {
    bootstrap::init_tracing();
    bootstrap::install_panic_hook();
    info!("=== World Core Startup ===");

    let config = bootstrap::load_config()?;
    let (handles, queues) = dispatch_queues();
    let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
    let outbound_worker = outbound::spawn(outbound_rx, handles.clone()).map_err(|source| {
        ServerError::Spawn {
            name: "outbound",
            source,
        }
    })?;

    let mut director = BotDirector::new(BotConfig::from_env(), &config, handles.clone());
    director.join_all()?;
    drop(handles);

    let mut dispatcher = Dispatcher::new(Arc::clone(&config), director, queues, outbound_tx)?;
    let metrics = dispatcher.metrics_handle();
    let mut supervisor = Supervisor::new(&config.supervisor);
    let result = supervisor.run(|| dispatcher.run_until_exit());
    drop(dispatcher);

    match outbound_worker.join() {
        Ok(stats) => info!(
            notifications = stats.notifications,
            persisted = stats.persisted,
            disconnects = stats.disconnects,
            "outbound_worker_stopped"
        ),
        Err(_) => warn!("outbound_worker_panicked"),
    }

    let exit = result?;
    let last = metrics.snapshot();
    info!(exit = ?exit, tps = last.tps, "server_stopped");
    Ok(())
}
