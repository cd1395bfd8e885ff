// src/main.rs

//! The main entry point for the Tidegate daemon.

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tidegate::config::Config;
use tidegate::core::telemetry::{
    AsyncLogDelivery, DeliveryLayer, MetricsCollector, sink_from_config,
};
use tidegate::server;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Tidegate version {}", tidegate::VERSION);
        return Ok(());
    }

    // The configuration path can be provided via --config; otherwise it
    // defaults to "config.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).map(|s| s.parse::<u16>()) {
            Some(Ok(port)) => config.port = port,
            Some(Err(_)) => {
                eprintln!("Invalid port number: {}", args[port_index + 1]);
                std::process::exit(1);
            }
            None => {
                eprintln!("--port flag requires a value");
                std::process::exit(1);
            }
        }
        config.validate()?;
    }

    // Metrics and log delivery exist before the subscriber so that every log
    // line from startup onwards goes through the bounded queue.
    let metrics = Arc::new(MetricsCollector::new(&config.metrics));
    let sink = sink_from_config(&config.log).context("Failed to open the log sink")?;
    let logs = Arc::new(AsyncLogDelivery::new(
        &config.log,
        sink,
        Some(Arc::clone(&metrics)),
    ));

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log_level")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(DeliveryLayer::new(Arc::clone(&logs)))
        .init();

    info!("Starting Tidegate {}.", tidegate::VERSION);
    let result = server::run(config, metrics, Arc::clone(&logs)).await;
    match &result {
        Ok(summary) => info!(?summary, "Tidegate stopped."),
        Err(e) => error!("Daemon runtime error: {:#}", e),
    }

    // Lines logged after the shutdown sequence drained the queue.
    logs.drain_all(Duration::from_millis(250));
    result.map(|_| ())
}
