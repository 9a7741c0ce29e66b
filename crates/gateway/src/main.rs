use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tg_gateway::cli::{load_config, show, Cli, Command, ConfigCommand};
use tg_gateway::server::serve_stdio;
use tg_gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, config_path) = load_config(cli.config.as_deref())?;
            tracing::info!(
                config = %config_path.display(),
                servers = config.servers.len(),
                policies = config.policies.len(),
                "toolgate starting"
            );
            run_server(config).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (_, config_path) = load_config(cli.config.as_deref())?;
            println!("{}: OK", config_path.display());
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _) = load_config(cli.config.as_deref())?;
            show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("toolgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_server(config: tg_domain::config::GatewayConfig) -> anyhow::Result<()> {
    let gateway = Arc::new(Gateway::build(config)?);
    gateway.start().await;
    tracing::info!("gateway ready on stdio");

    tokio::select! {
        result = serve_stdio(Arc::clone(&gateway)) => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "stdio loop ended with error");
            } else {
                tracing::info!("stdin closed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
    }

    gateway.shutdown().await;
    Ok(())
}

/// Log to stderr so stdout stays clean for the tool protocol.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("TG_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
