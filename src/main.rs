//! Goblin - MCP aggregation gateway

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use goblin::cli::{Cli, Command};
use goblin::config::Config;
use goblin::daemon::Daemon;
use goblin::setup_tracing;
use goblin::transport::{DefaultTransportFactory, TransportFactory};

#[tokio::main]
async fn main() -> ExitCode {
    // Local .env first so config env overrides can come from it.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Status { lock_port }) => control_get(lock_port, "status").await,
        Some(Command::Stop { lock_port }) => control_stop(lock_port).await,
        Some(Command::Run) | None => run_daemon(&cli).await,
    }
}

async fn run_daemon(cli: &Cli) -> ExitCode {
    let config_path = cli.config.clone().or_else(default_config_path);

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backends = config.servers.len(),
        transport = ?config.gateway.transport,
        "Starting goblin"
    );

    let factory: Arc<dyn TransportFactory> = Arc::new(DefaultTransportFactory);
    let daemon = Daemon::new(config, factory);

    spawn_reload_on_sighup(&daemon, config_path);

    if let Err(e) = Arc::clone(&daemon).run().await {
        error!("Daemon error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// SIGHUP re-reads the configuration file and reconciles backends.
#[cfg(unix)]
fn spawn_reload_on_sighup(daemon: &Arc<Daemon>, config_path: Option<std::path::PathBuf>) {
    let Some(path) = config_path else { return };
    let daemon = Arc::clone(daemon);
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            return;
        };
        while hangup.recv().await.is_some() {
            info!(path = %path.display(), "SIGHUP: reloading configuration");
            match Config::load(Some(&path)) {
                Ok(fresh) => daemon.reload(&fresh).await,
                Err(e) => warn!("Reload failed, keeping current configuration: {e}"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_sighup(_daemon: &Arc<Daemon>, _config_path: Option<std::path::PathBuf>) {}

fn default_config_path() -> Option<std::path::PathBuf> {
    let path = dirs::config_dir()?.join("goblin").join("config.json");
    path.exists().then_some(path)
}

async fn control_get(lock_port: Option<u16>, endpoint: &str) -> ExitCode {
    let port = lock_port.unwrap_or_else(|| Config::default().gateway.lock_port);
    let url = format!("http://127.0.0.1:{port}/{endpoint}");

    match reqwest::get(&url).await {
        Ok(response) => match response.text().await {
            Ok(body) => {
                println!("{body}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Failed to read daemon response: {e}");
                ExitCode::FAILURE
            }
        },
        Err(_) => {
            println!("No daemon running on lock port {port}");
            ExitCode::FAILURE
        }
    }
}

async fn control_stop(lock_port: Option<u16>) -> ExitCode {
    let port = lock_port.unwrap_or_else(|| Config::default().gateway.lock_port);
    let url = format!("http://127.0.0.1:{port}/stop");

    let client = reqwest::Client::new();
    match client.post(&url).send().await {
        Ok(_) => {
            println!("Stop requested");
            ExitCode::SUCCESS
        }
        Err(_) => {
            println!("No daemon running on lock port {port}");
            ExitCode::FAILURE
        }
    }
}
