use anyhow::Result;
use clap::{Parser, Subcommand};

use ratchet_core::config::{ExecutorKind, RatchetConfig};
use ratchet_core::registry::WorkflowRegistry;
use ratchet_runtime::{Engine, QueueWorkerConfig};

/// RATCHET - durable workflow orchestration engine.
#[derive(Parser)]
#[command(name = "ratchet")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Serve the process API.
    Serve(ServeCommand),
}

/// Serve the process API and, on the queue backend, a worker loop.
///
/// Workflows are registered by the embedding application; a bare `ratchet
/// serve` exposes the engine over an empty registry, which is enough to
/// inspect and administer historical runs.
#[derive(Parser)]
pub struct ServeCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "ratchet.toml")]
    pub config: String,

    /// Port to listen on (overrides config).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Also run a queue worker on this node (queue executor only).
    #[arg(long)]
    pub worker: bool,
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve(cmd) => cmd.execute().await,
        }
    }
}

impl ServeCommand {
    async fn execute(self) -> Result<()> {
        dotenvy::dotenv().ok();
        tracing_subscriber::fmt()
            .with_env_filter(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            )
            .init();

        tracing::info!(config = %self.config, "Loading configuration");
        let mut config = RatchetConfig::from_file(&self.config)?;
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        let port = config.gateway.port;
        let executor = config.engine.executor;

        let engine = Engine::init(config, WorkflowRegistry::new()).await?;

        // Re-arm processes that were running when the previous instance
        // stopped.
        let recovered = engine.recover_running().await?;
        if recovered > 0 {
            tracing::info!(count = recovered, "Re-armed running processes");
        }

        if self.worker {
            if executor == ExecutorKind::Queue {
                let worker = engine.queue_worker(QueueWorkerConfig::default());
                tokio::spawn(async move { worker.run().await });
            } else {
                tracing::warn!("--worker has no effect with the pool executor");
            }
        }

        let router = ratchet_runtime::router(engine.clone());
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(port, "Process API listening");

        tokio::select! {
            result = axum::serve(listener, router) => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
        }

        engine.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve() {
        let cli = Cli::try_parse_from(["ratchet", "serve", "--config", "custom.toml"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_serve_with_worker() {
        let cli = Cli::try_parse_from(["ratchet", "serve", "--worker", "--port", "9000"]).unwrap();
        match cli.command {
            Commands::Serve(cmd) => {
                assert!(cmd.worker);
                assert_eq!(cmd.port, Some(9000));
            }
        }
    }
}
