pub mod mediator;
pub mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::ai::HttpAiAgent;
use crate::completion::CompletionProvider;
use crate::config;
use crate::storage::ServerStorage;
use crate::transport::WsTransport;

pub use mediator::{ServerController, SessionRuntime};
pub use tracker::CommandTracker;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Bring the server up and tick until SIGINT/SIGTERM.
pub fn run(server_config: ServerConfig) -> anyhow::Result<()> {
    let data_root = config::initialize().context("create data directory")?;
    tracing::info!(path = %data_root.display(), "data storage path");

    let storage =
        ServerStorage::open(&config::server_db_path(&data_root)).context("open server storage")?;
    match storage.was_last_run_crashed() {
        Ok(true) => tracing::warn!("previous server run was not properly shut down"),
        Ok(false) => {}
        Err(e) => tracing::warn!(error = %e, "crash detection query failed"),
    }
    let run_id = storage.record_start().context("record server start")?;
    tracing::info!(run_id, "server run recorded");

    let transport = WsTransport::bind(&server_config.bind_address, server_config.port)?;
    let completion = CompletionProvider::new();
    let ai = HttpAiAgent::new();

    let mut controller =
        ServerController::new(transport, ai, storage, data_root, run_id, completion);

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))
        .context("register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))
        .context("register SIGTERM handler")?;

    tracing::info!("server started, waiting for clients");
    while !stop.load(Ordering::Relaxed) {
        controller.tick();
        std::thread::sleep(Duration::from_millis(10));
    }

    tracing::info!("shutdown signal received");
    controller.shutdown();
    Ok(())
}
