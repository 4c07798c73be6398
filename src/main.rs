mod commands;

use std::io::ErrorKind;
use std::sync::Arc;

use axum::Router;
use clap::{Parser, Subcommand};
use copilot_bridge_core::config::{BridgeConfig, load_config};
use copilot_bridge_core::{ProxyService, router as proxy_router};
use owo_colors::OwoColorize;
use reqwest::Client;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "copilot-bridge")]
#[command(about = "OpenAI-compatible proxy in front of GitHub Copilot", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Errors related to copilot-bridge's own config.toml
    #[error("Config error: {0}")]
    Config(String),
    /// Errors talking to GitHub during login / subscription checks
    #[error("GitHub error: {0}")]
    GitHub(String),
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(format!("{e:#}"))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP proxy (default when no command is given)
    Serve {
        /// Listen address; overrides [server].host and COPILOT_BRIDGE_HOST
        #[arg(long)]
        host: Option<String>,
        /// Listen port; overrides [server].port and PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Obtain a GitHub user token through the device flow
    Login,
    /// Show the Copilot plan of a GitHub user token
    Check {
        /// GitHub user token (ghu_... / gho_...)
        ghu: String,
    },
    /// Manage ~/.copilot-bridge/config.toml
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a commented config.toml template
    Init {
        /// Overwrite an existing config.toml (the old file is kept as config.toml.bak)
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
    /// Print the effective config (file + environment overrides)
    Show,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("{}", err.to_string().red());
        std::process::exit(1);
    }
}

async fn real_main() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Login => {
            let _log_guard = init_tracing(None);
            commands::auth::handle_login().await?;
        }
        Command::Check { ghu } => {
            let _log_guard = init_tracing(None);
            commands::auth::handle_check(&ghu).await?;
        }
        Command::Config { cmd } => {
            let _log_guard = init_tracing(None);
            commands::config::handle_config_cmd(cmd).await?;
        }
        Command::Serve { host, port } => {
            let cfg = effective_config(host, port)
                .await
                .map_err(|e| CliError::Config(format!("{e:#}")))?;
            let _log_guard = init_tracing(cfg.log.dir.as_deref());
            run_server(cfg)
                .await
                .map_err(|e| CliError::Other(format!("{e:#}")))?;
        }
    }

    Ok(())
}

/// File values, then environment, then command-line flags.
pub(crate) async fn effective_config(
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<BridgeConfig> {
    let mut cfg = load_config().await?;
    cfg.apply_env_overrides();
    if let Some(host) = host {
        cfg.server.host = host;
    }
    if let Some(port) = port {
        cfg.server.port = port;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    // Default to info logs unless the user sets RUST_LOG.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_dir) = log_dir {
        if let Err(err) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "{}",
                format!("cannot create log dir {:?}: {err}; logging to stderr", log_dir).yellow()
            );
        } else {
            let file_appender = tracing_appender::rolling::daily(log_dir, "copilot-bridge.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(non_blocking)
                .init();
            return Some(guard);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

async fn run_server(cfg: BridgeConfig) -> anyhow::Result<()> {
    let host = cfg.server.host.clone();
    let port = cfg.server.port;
    let client = Client::builder().build()?;

    let proxy = ProxyService::new(client, Arc::new(cfg))?;
    let app: Router = proxy_router(proxy);

    let listener = bind_listener_or_explain(&host, port).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("copilot-bridge listening on http://{}", local_addr);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, draining connections");
        let _ = shutdown_tx.send(true);
    });

    let server_shutdown = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(server_shutdown)
        .await?;

    Ok(())
}

async fn bind_listener_or_explain(
    host: &str,
    port: u16,
) -> anyhow::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|err| {
            let help = listener_bind_help(host, port, &err);
            anyhow::Error::new(err).context(help)
        })
}

fn listener_bind_help(host: &str, port: u16, err: &std::io::Error) -> String {
    let example_cmd = format!(
        "copilot-bridge serve --host {host} --port {}",
        port.saturating_add(1)
    );

    let os_code = err.raw_os_error();
    let kind = err.kind();
    let is_addr_in_use = kind == ErrorKind::AddrInUse || os_code == Some(10048);
    let is_permission_denied = kind == ErrorKind::PermissionDenied || os_code == Some(10013);

    if is_addr_in_use {
        return format!(
            "cannot listen on http://{host}:{port}: port {port} is already in use.\n\
- stop the process holding it, or pick another port, e.g. `{example_cmd}` (or set PORT)"
        );
    }

    if is_permission_denied {
        return format!(
            "cannot listen on http://{host}:{port}: permission denied for port {port}.\n\
- ports below 1024 usually need elevated privileges; try `{example_cmd}`"
        );
    }

    if kind == ErrorKind::AddrNotAvailable || kind == ErrorKind::InvalidInput {
        return format!(
            "cannot listen on http://{host}:{port}: {host:?} is not a local address.\n\
- use 127.0.0.1 or 0.0.0.0, e.g. `copilot-bridge serve --host 127.0.0.1 --port {port}`"
        );
    }

    format!(
        "cannot listen on http://{host}:{port}.\n\
- try another port, e.g. `{example_cmd}`"
    )
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn wait_for_shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("cannot listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}
