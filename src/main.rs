mod config;
mod credentials;
mod error;
mod logging;
mod models;
mod obfuscate;
mod openai;
mod proxy;
mod upstream;

use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};

use crate::config::{ProxyConfig, init_config_toml, load_config};
use crate::models::ModelCatalog;
use crate::proxy::{APP_NAME, ProxyService, router as proxy_router};

#[derive(Parser, Debug)]
#[command(name = "sense-proxy")]
#[command(about = "OpenAI-compatible chat proxy in front of SenseChat", long_about = None)]
struct Cli {
    /// Config file; defaults to ~/.sense-proxy/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP proxy server (default)
    Serve {
        /// Listen address; overrides server.host
        #[arg(long)]
        host: Option<String>,
        /// Listen port; overrides server.port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
    /// Print the model ids advertised on /v1/models
    Models,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write a commented config.toml template
    Init {
        /// Overwrite an existing file (the old one is kept as .bak)
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Config {
            cmd: ConfigCommand::Init { force },
        } => {
            let path = init_config_toml(config_path, force).await?;
            println!("Wrote config template to {}", path.display());
            Ok(())
        }
        Command::Models => {
            let cfg = load_config(config_path).await?;
            let catalog = ModelCatalog::new(cfg.model_mapping);
            for id in catalog.model_ids() {
                let target = catalog.resolve(&id);
                if target == id {
                    println!("{id}");
                } else {
                    println!("{id} -> {target}");
                }
            }
            Ok(())
        }
        Command::Serve { host, port } => {
            let mut cfg = load_config(config_path).await?;
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            serve(cfg).await
        }
    }
}

async fn serve(cfg: ProxyConfig) -> Result<()> {
    // Keep the guard alive so the file writer flushes on exit.
    let _log_guard = logging::init_tracing(&cfg.logging)?;

    let proxy = ProxyService::from_config(&cfg)?;
    let (tokens, cookies) = proxy.rotator().pool_sizes();
    if proxy.rotator().is_configured() {
        tracing::info!(
            "credential pools loaded: {} auth tokens, {} cookies",
            tokens,
            cookies
        );
    } else {
        tracing::warn!(
            "SENSE_API_KEYS_STR or SENSE_COOKIES_STR is empty; chat requests will fail until both are set"
        );
    }
    if proxy.master_key().is_none() {
        tracing::warn!("API_MASTER_KEY is not set; /v1 routes are open to anyone who can reach them");
    }

    let app: Router = proxy_router(proxy);
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        "{} {} listening on http://{} (upstream: {})",
        APP_NAME,
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?,
        cfg.upstream.base_url
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("{} stopped", APP_NAME);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown signal received, draining connections");
}
