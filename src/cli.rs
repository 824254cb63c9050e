use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "concilio")]
#[command(about = "Multi-backend LLM dispatcher with consensus merging")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a question and print the merged consensus answer
    Query {
        /// The question to dispatch
        question: String,

        /// Context tag used to pick specialized backends
        #[arg(short = 't', long, default_value = "general")]
        context: String,

        /// Caller identity for rate limiting
        #[arg(long, default_value = "cli")]
        caller: String,

        /// Minimum acceptable consensus confidence
        #[arg(short, long)]
        min_confidence: Option<f64>,

        /// Print the full result as JSON instead of plain text
        #[arg(long)]
        json: bool,
    },

    /// List registered backends
    Models,

    /// Show pool and circuit breaker diagnostics
    Stats,

    /// Print the active configuration
    Config,
}
