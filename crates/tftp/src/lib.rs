//! In-memory TFTP Server
//!
//! A TFTP (RFC 1350) server that keeps every file it receives in process
//! memory and serves it back to readers. Nothing touches the disk and the
//! files vanish when the process exits.
//!
//! # Features
//!
//! - Read (RRQ) and write (WRQ) requests in 512-byte blocks
//! - One ephemeral socket per transfer, released when the transfer ends
//! - Retransmission with per-block deadlines on reads, duplicate suppression
//!   and re-acknowledgment on writes
//! - Files shared between concurrent transfers through a single-owner store
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tftp::{ServerConfig, TftpServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Arc::new(TftpServer::new(ServerConfig::new(6969, Duration::from_secs(1))));
//!
//!     let listener = tokio::spawn({
//!         let server = server.clone();
//!         async move { server.listen().await }
//!     });
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     listener.await?
//! }
//! ```

mod channel;
mod protocol;
mod server;
mod store;
mod transfer;

pub use channel::*;
pub use protocol::*;
pub use server::*;
pub use store::*;
pub use transfer::*;
