//! Multi-room TCP Chat Server - Entry Point
//!
//! Starts the server and runs the operator console on stdin:
//! `/shutdown <seconds>` for a graceful shutdown, `/exit` for an
//! immediate stop.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chatrooms::{parse_console, ChatServer, ConsoleLine};

/// Default server address
const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chatrooms=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatrooms=info")),
        )
        .init();

    // Get bind address from command line or use default
    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string())
        .parse()?;

    let server = Arc::new(ChatServer::new(addr));
    server.run().await?;

    // Operator console loop
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_console(&line) {
            ConsoleLine::Shutdown(seconds) => {
                info!("Shutting down with a {}s drain timeout", seconds);
                if let Err(e) = server.shutdown(Duration::from_secs(seconds)).await {
                    error!("Shutdown failed: {}", e);
                }
                break;
            }
            ConsoleLine::Exit => {
                if let Err(e) = server.stop() {
                    error!("Stop failed: {}", e);
                }
                break;
            }
            ConsoleLine::Invalid(reason) => {
                error!("{}", reason);
            }
        }
    }

    Ok(())
}
