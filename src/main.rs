//! Warden - supervised worker for the Modbus MCP collector
//!
//! Runs the threading service with the simulated Modbus collector until
//! interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults (~/.warden/config.yaml if present)
//! warden
//!
//! # With an explicit config file and verbose logging
//! warden --config warden.yaml -v
//!
//! # Send a few demo reads after startup
//! warden --demo-requests 5
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};
use warden_config::WardenConfig;
use warden_core::{LogGuard, init_logging};
use warden_worker::{SendOptions, ThreadingService};

/// Supervised worker for the Modbus MCP collector
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.warden/config.yaml when it exists)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.warden/logs/)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of demo read requests to send after startup
    #[arg(long, default_value_t = 0)]
    demo_requests: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::from(1);
        }
    };

    match run(&cli).await {
        Ok(()) => {
            info!("Warden exited normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Warden error: {e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn setup_logging(cli: &Cli) -> warden_core::Result<LogGuard> {
    init_logging(cli.log_dir.clone(), cli.verbose)
}

fn show_guidance(guidance: Option<&str>) {
    if let Some(hint) = guidance {
        warn!(hint, "Suggested fix");
        eprintln!("Hint: {hint}");
    }
}

/// Explicit path, else the default file if it exists, else built-in defaults.
fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(|| {
        dirs::home_dir()
            .map(|home| home.join(".warden").join("config.yaml"))
            .filter(|path| path.exists())
    })
}

async fn run(cli: &Cli) -> Result<()> {
    let path = config_path(cli);
    let config = WardenConfig::load(path.as_deref())
        .inspect_err(|e| show_guidance(e.guidance()))
        .context("failed to load configuration")?;
    if let Some(path) = &path {
        info!(path = %path.display(), "Using configuration file");
    }

    let service = ThreadingService::with_collector(config);
    let started = service.start().await;
    if !started.success {
        show_guidance(started.guidance);
        bail!(
            "{}: {}",
            started.message,
            started.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    let status = service.get_status().await;
    info!(
        thread = status.worker.thread_name.as_deref().unwrap_or("-"),
        actions = ?status.worker.actions,
        "Worker running"
    );

    run_demo(&service, cli.demo_requests).await;

    info!("Press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, stopping now");
    }

    let stopped = service.stop(true).await;
    let stats = service.get_stats().await;
    info!(
        sent = stats.messages.total_sent,
        succeeded = stats.messages.total_succeeded,
        errors = stats.errors.total_errors,
        "Final statistics"
    );
    if !stopped.success {
        bail!("{}", stopped.message);
    }
    Ok(())
}

async fn run_demo(service: &ThreadingService, requests: u32) {
    if requests == 0 {
        return;
    }

    if let Err(e) = service.send_message(SendOptions::new("start", json!({}))).await {
        warn!(error = %e, "Failed to start collection");
    }
    for i in 0..requests {
        let priority = if i % 2 == 0 { "normal" } else { "high" };
        let options = SendOptions::new("read", json!({ "count": 4 })).with_priority(priority);
        match service.send_message(options).await {
            Ok(response) => info!(request = i, data = ?response.data, "Demo read"),
            Err(e) => warn!(request = i, error = %e, "Demo read failed"),
        }
    }
    match service.send_message(SendOptions::new("statistics", json!({}))).await {
        Ok(response) => info!(data = ?response.data, "Collector statistics"),
        Err(e) => warn!(error = %e, "Failed to read statistics"),
    }
}
