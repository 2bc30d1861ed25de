//! Loopwire CLI: the main entry point.
//!
//! Commands:
//! - `chat`: Run one message through the agent loop and print the stream
//! - `gateway`: Start the HTTP/SSE server
//! - `config`: Print the default configuration or the config file path

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "loopwire",
    about = "Loopwire: streaming agentic tool-calling loop",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message to the agent and print its event stream
    Chat {
        /// The user message
        #[arg(short, long)]
        message: String,

        /// Print only the answer text instead of the SSE transcript
        #[arg(long)]
        plain: bool,
    },

    /// Start the HTTP gateway server
    Gateway {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the default configuration
    Config {
        /// Print the config file path instead
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays a clean transcript.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Chat { message, plain } => commands::chat::run(message, plain).await?,
        Commands::Gateway { port } => commands::gateway::run(port).await?,
        Commands::Config { path } => commands::config_cmd::run(path)?,
    }

    Ok(())
}
