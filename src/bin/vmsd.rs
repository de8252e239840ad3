//! vmsd - Video Monitoring Service daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment overrides)
//! 2. Starts a pipeline for every configured stream
//! 3. Serves the stream API
//! 4. On Ctrl-C, stops the API and every pipeline

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use vms::{
    api::{ApiConfig, ApiServer},
    StreamRegistry, VmsConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-stream video ingestion and analysis service")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "VMS_CONFIG")]
    config: Option<PathBuf>,

    /// API listen address; overrides the configuration file and VMS_API_ADDR.
    #[arg(long)]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = VmsConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let registry = Arc::new(StreamRegistry::new(
        config.pipeline.clone(),
        config.analysis.clone(),
    ));

    for entry in &config.streams {
        match registry.create(entry.id.as_deref(), &entry.url) {
            Ok(id) => log::info!("initialized stream {} ({})", id, entry.url),
            Err(err) => log::warn!("skipping configured stream {}: {}", entry.url, err),
        }
    }

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
        },
        Arc::clone(&registry),
    )
    .spawn()?;
    log::info!(
        "vmsd running: {} streams, api on {}",
        registry.len(),
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("vmsd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    registry.shutdown();

    Ok(())
}
