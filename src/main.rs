use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tessera_runtime::{AppState, Config};

#[derive(Parser)]
#[command(name = "tessera", version, about = "Tessera LLM application platform")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the platform server and background workers
    Serve {
        /// Listen port (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate configuration and print the resolved (secret-free) view
    Config,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    // `.env` first so Config::from_env sees it.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Config => {
            let config = Config::from_env().context("configuration invalid")?;
            println!("{}", serde_json_view(&config)?);
            Ok(())
        }
        Commands::Serve { port } => {
            let mut config = Config::from_env().context("configuration invalid")?;
            if let Some(port) = port {
                config.server.port = port;
            }

            let state = AppState::from_config(config).context("failed to build runtime")?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                wait_for_signal().await;
                tracing::info!("shutdown signal received, draining");
                let _ = shutdown_tx.send(true);
            });

            tessera_runtime::serve(state, shutdown_rx)
                .await
                .context("server exited with error")?;
            tracing::info!("clean shutdown");
            Ok(())
        }
    }
}

fn serde_json_view(config: &Config) -> anyhow::Result<String> {
    // Secrets carry skip_serializing, so this view is safe to print.
    Ok(serde_json::to_string_pretty(config)?)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
