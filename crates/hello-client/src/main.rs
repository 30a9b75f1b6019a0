//! Reference device client.
//!
//! Resolves the device identity, opens a WebSocket session to the device
//! gateway, and keeps it up (with backoff retries) until Ctrl-C.
//!
//! Usage:
//!   CASTAR_DEV_KEY=dk-... cs-hello-client
//!
//! Env vars:
//!   CS_CONFIG        config file path (default: castar.toml)
//!   CASTAR_DEV_KEY   developer key, when not set in the config
//!   CASTAR_DEV_SN    device serial override
//!   RUST_LOG         log filter, overrides `logging.filter`

mod cli;
mod ws_connector;

use std::sync::Arc;

use clap::Parser;
use cs_client_sdk::{supervise, ClientBuilder, DeviceIdentity, RetryBackoff, StaticIdentity};
use cs_domain::config::{ClientConfig, LogFormat, LoggingConfig};
use cs_domain::identity::mask_secret;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ConfigCommand};
use ws_connector::WsConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, config_path) = cli::load_config()?;

    match cli.command {
        None => run(config, false).await,
        Some(Command::Run { no_supervise }) => run(config, no_supervise).await,
        Some(Command::Config(ConfigCommand::Validate)) => {
            init_cli_tracing();
            if !cli::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            init_cli_tracing();
            cli::show(&config)
        }
        Some(Command::Identity) => {
            init_cli_tracing();
            let identity = StaticIdentity::resolve(&config.identity, None)?;
            let out = serde_json::json!({
                "dev_key": mask_secret(identity.dev_key()),
                "dev_sn": identity.dev_sn(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init(),
    }
}

/// Quiet stderr logging for one-shot subcommands.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run(config: ClientConfig, no_supervise: bool) -> anyhow::Result<()> {
    init_tracing(&config.logging);

    if config.has_errors() {
        for issue in config.validate() {
            tracing::error!(%issue, "config");
        }
        anyhow::bail!("invalid configuration");
    }

    let identity = Arc::new(StaticIdentity::resolve(&config.identity, None)?);
    let connector = Arc::new(WsConnector::new(&config.connector, identity.as_ref()));
    let session_lost = connector.session_lost();

    let client = ClientBuilder::new()
        .config(&config)
        .identity(identity)
        .connector(connector)
        .create()?;
    tracing::info!(client = ?client, "client ready");

    let shutdown = CancellationToken::new();
    let supervisor = (config.retry.supervise && !no_supervise).then(|| {
        supervise(
            client.clone(),
            RetryBackoff::from_config(&config.retry),
            shutdown.clone(),
        )
    });

    if let Err(e) = client.start().await {
        if supervisor.is_none() {
            return Err(e.into());
        }
        tracing::warn!(error = %e, "initial start failed, retrying in background");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = session_lost.notified() => {
                tracing::warn!("session lost, restarting");
                // A failed reopen reaches the supervisor as StartFailed.
                if let Err(e) = client.restart().await {
                    tracing::warn!(error = %e, "restart failed");
                }
            }
        }
    }

    shutdown.cancel();
    let stopped = client.stop().await;
    if let Some(handle) = supervisor {
        let exit = handle.await?;
        tracing::debug!(?exit, "supervisor exited");
    }
    stopped?;

    tracing::info!("client stopped");
    Ok(())
}
