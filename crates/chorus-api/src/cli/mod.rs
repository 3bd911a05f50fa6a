//! CLI command definitions for the `chorus` binary.

pub mod agents;
pub mod chat;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use chorus_types::conversation::ConversationMode;

/// Several persona agents answering one message together.
#[derive(Parser)]
#[command(name = "chorus", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Data directory holding chorus.toml and chorus.db.
    #[arg(long, global = true, env = "CHORUS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Serve every provider from the in-process scripted provider.
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a message and stream the agents' replies.
    Chat {
        /// The user message.
        text: String,

        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<Uuid>,

        /// Scheduling mode (fixed, dynamic, natural, smart).
        #[arg(long)]
        mode: Option<ConversationMode>,

        /// Seed for natural-mode ordering.
        #[arg(long)]
        seed: Option<u64>,

        /// Cost budget for this run.
        #[arg(long)]
        budget: Option<f64>,
    },

    /// List persona agents.
    Agents {
        /// Include disabled agents.
        #[arg(long)]
        all: bool,
    },

    /// List the flows used by fixed mode.
    Flows,

    /// Start the HTTP API server.
    Serve {
        /// Port to listen on.
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}
