//! PropStream CLI
//!
//! Command-line interface for the PropStream realtime channel.
//! `watch` keeps a link open and prints every interpreted action;
//! `send` publishes a single message and exits.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod send;
mod watch;

/// PropStream - realtime cockpit sync from a terminal
#[derive(Parser, Debug)]
#[command(name = "propstream")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected and print interpreted actions
    Watch(watch::WatchArgs),
    /// Send one message on a channel
    Send(send::SendArgs),
}

/// Endpoint and credentials shared by every subcommand
#[derive(clap::Args, Debug, Clone)]
pub struct EndpointArgs {
    /// Realtime endpoint (wins over the origin)
    #[arg(long, env = "PROPSTREAM_REALTIME_URL")]
    pub url: Option<String>,

    /// Application origin used to derive the endpoint
    #[arg(long, env = "PROPSTREAM_ORIGIN")]
    pub origin: Option<String>,

    /// Access token appended to the endpoint
    #[arg(long, env = "PROPSTREAM_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl EndpointArgs {
    /// Base connect options for these arguments
    pub fn options(&self) -> propstream_core::ConnectOptions {
        let mut options = propstream_core::ConnectOptions::new();
        if let Some(url) = &self.url {
            options = options.with_url(url.clone());
        }
        if let Some(origin) = &self.origin {
            options = options.with_origin(origin.clone());
        }
        if let Some(token) = &self.token {
            options = options.with_token(propstream_core::TokenSource::from_static(token.clone()));
        }
        options
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout stays parseable in json mode
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Watch(args) => watch::run(args).await,
        Command::Send(args) => send::run(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
