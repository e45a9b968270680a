//! In-memory TFTP Server - Main executable
//!
//! Serves TFTP reads and writes from process memory. Files written by clients
//! are kept until the process exits.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{DEFAULT_PORT, ServerConfig, TftpServer};
use tokio::task::JoinError;

const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

#[derive(FromArgs, Debug)]
#[argh(
    description = "In-memory TFTP server: files written by clients are kept in memory and served back to readers",
    example = "Listen on the standard port (needs privileges):\n  {command_name}",
    example = "Listen on an unprivileged port on loopback only:\n  {command_name} --port 6969 --bind 127.0.0.1"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'p',
        description = "port to listen for connections",
        default = "DEFAULT_PORT"
    )]
    port: u16,

    #[argh(
        option,
        short = 'b',
        description = "address to listen on",
        default = "IpAddr::V4(Ipv4Addr::UNSPECIFIED)"
    )]
    bind: IpAddr,

    #[argh(
        option,
        description = "how often the listener checks for shutdown, in milliseconds",
        default = "DEFAULT_POLL_INTERVAL_MS"
    )]
    poll_interval_ms: u64,
}

impl CliConfig {
    fn into_server_config(self) -> ServerConfig {
        ServerConfig {
            bind_ip: self.bind,
            ..ServerConfig::new(self.port, Duration::from_millis(self.poll_interval_ms))
        }
    }
}

fn handle_listener_result(result: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => {
            tracing::info!("TFTP server exited");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("TFTP server failed: {:#}", e);
            Err(e)
        }
        Err(e) => {
            tracing::error!("TFTP server task panicked: {}", e);
            Err(anyhow::anyhow!("TFTP server task panicked: {}", e))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli_config: CliConfig = argh::from_env();
    let config = cli_config.into_server_config();
    tracing::info!("Starting in-memory TFTP server on {}", config.bind_address());

    let server = Arc::new(TftpServer::new(config));
    let mut listener = tokio::spawn({
        let server = server.clone();
        async move { server.listen().await }
    });

    tokio::select! {
        result = &mut listener => return handle_listener_result(result),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutdown requested");
            server.stop().await;
        }
    }

    handle_listener_result(listener.await)
}
