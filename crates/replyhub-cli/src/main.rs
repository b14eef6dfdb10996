//! ReplyHub CLI - sign in, inspect the session, and call the backend.
//!
//! The session survives between invocations through the configured storage
//! backend; every command starts by restoring and reconciling it.

mod commands;

use std::io;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// When set, logs are also written to a daily-rotated file in this directory.
const LOG_DIR_ENV: &str = "REPLYHUB_LOG_DIR";

#[derive(Parser)]
#[command(name = "replyhub", version, about = "ReplyHub session and API client")]
struct Cli {
    /// Backend base URL
    #[arg(long, global = true, env = "REPLYHUB_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an account and sign in
    Register {
        #[arg(long)]
        email: Option<String>,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show the current session
    Status,
    /// Ask the backend who the session belongs to
    Me,
    /// Send an authenticated request and print the response
    Request {
        /// HTTP method, e.g. GET or POST
        method: String,
        /// Endpoint path, e.g. /api/threads
        endpoint: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "replyhub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing();
    info!("ReplyHub CLI starting");

    let mut app = commands::App::open(cli.api_url).await?;
    let result = match cli.command {
        Command::Login { email } => app.login(email).await,
        Command::Register { email } => app.register(email).await,
        Command::Logout => app.logout().await,
        Command::Status => app.status(),
        Command::Me => app.me().await,
        Command::Request {
            method,
            endpoint,
            data,
        } => app.request(&method, &endpoint, data.as_deref()).await,
    };
    app.close();
    result
}
