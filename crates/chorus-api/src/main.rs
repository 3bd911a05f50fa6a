//! Chorus CLI and HTTP API entry point.
//!
//! Binary name: `chorus`
//!
//! Parses CLI arguments, sets up tracing, opens the data directory, then
//! dispatches to a command handler or starts the HTTP server.

mod cli;
mod http;
mod state;

use anyhow::Context;
use clap::Parser;

use chorus_observe::tracing_setup::{self, TracingOptions};

use cli::chat::ChatOptions;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_setup::init_tracing(&TracingOptions {
        default_filter: tracing_setup::default_filter(cli.verbose, cli.quiet).to_string(),
        json: false,
        otel: cli.otel,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    tracing_setup::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let data_dir = chorus_infra::config::resolve_data_dir(cli.data_dir.clone())?;
    let state = AppState::init(data_dir, cli.offline).await?;

    match cli.command {
        Commands::Chat {
            text,
            conversation,
            mode,
            seed,
            budget,
        } => {
            let options = ChatOptions {
                text,
                conversation,
                mode,
                seed,
                budget,
                json: cli.json,
            };
            cli::chat::chat(&state, options).await?;
        }

        Commands::Agents { all } => {
            cli::agents::list_agents(&state, all, cli.json).await?;
        }

        Commands::Flows => {
            cli::agents::list_flows(&state, cli.json).await?;
        }

        Commands::Serve { port, host } => {
            let router = http::router::build_router(state);
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;

            println!();
            println!("  Chorus API listening on http://{addr}");
            println!("  Health: http://{addr}/health");
            println!("  Press Ctrl+C to stop.");
            println!();

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            println!("\n  Server stopped.");
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
