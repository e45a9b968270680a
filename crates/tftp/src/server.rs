//! TFTP Server Implementation
//!
//! This module contains the main TFTP server logic that handles incoming
//! requests on the well-known port and dispatches them to transfer tasks.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::channel::{ReplyChannel, UdpChannel};
use crate::protocol::{ErrorCode, MAX_DATAGRAM, Packet, PacketError};
use crate::store::FileStore;
use crate::transfer::{ReadOutcome, TransferConfig, WriteOutcome, read_transfer, write_transfer};

/// Well-known TFTP port
pub const DEFAULT_PORT: u16 = 69;

const POLL_INTERVAL_SECS: u64 = 10;

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    /// How often the listen loop checks for a stop request
    pub poll_interval: Duration,
    pub transfer: TransferConfig,
}

impl ServerConfig {
    /// Listen on `port` of every interface
    pub fn new(port: u16, poll_interval: Duration) -> Self {
        Self {
            port,
            poll_interval,
            ..Default::default()
        }
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            transfer: TransferConfig::default(),
        }
    }
}

/// Main TFTP server
///
/// [`listen`](Self::listen) runs until [`stop`](Self::stop) is called from
/// another task. Transfers already in progress are not cancelled by a stop;
/// they run to their own end.
#[derive(Debug)]
pub struct TftpServer {
    config: ServerConfig,
    store: FileStore,
    shutdown: CancellationToken,
    finished: CancellationToken,
    ready: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl TftpServer {
    /// Create a new TFTP server with the given configuration
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            store: FileStore::new(),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            ready: CancellationToken::new(),
            local_addr: OnceLock::new(),
        }
    }

    /// Create a new TFTP server with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Get the server's configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The files served and received by this server
    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Get the local address the server is bound to (if listening)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Wait until the listening socket is bound, or binding has failed
    pub async fn ready(&self) {
        self.ready.cancelled().await
    }

    /// Bind the well-known port and serve requests until stopped
    ///
    /// Failing to bind is the only error; everything after that is handled
    /// and logged per packet or per transfer.
    pub async fn listen(&self) -> Result<()> {
        let _finished = self.finished.clone().drop_guard();
        let _ready = self.ready.clone().drop_guard();

        let socket = UdpSocket::bind(self.config.bind_address())
            .await
            .with_context(|| format!("Unable to open port {}", self.config.port))?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;
        let _ = self.local_addr.set(local_addr);
        self.ready.cancel();

        tracing::info!("TFTP server listening on {}", local_addr);
        self.serve(Arc::new(socket)).await;
        tracing::info!("TFTP server on {} stopped", local_addr);
        Ok(())
    }

    /// Ask the listen loop to exit and wait until it has
    ///
    /// The loop notices within one poll interval. Must only be called once
    /// [`listen`](Self::listen) has been started, otherwise it waits forever.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.finished.cancelled().await;
    }

    /// Main server loop
    async fn serve(&self, socket: Arc<UdpSocket>) {
        let mut buffer = [0u8; MAX_DATAGRAM];

        while !self.shutdown.is_cancelled() {
            let (len, peer) = match timeout(self.config.poll_interval, socket.recv_from(&mut buffer)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    tracing::error!("Error reading from listening socket: {}", e);
                    continue;
                }
                Ok(Ok(received)) => received,
            };
            tracing::debug!("Received {} bytes from {}", len, peer);

            let reply = ReplyChannel::new(socket.clone(), peer);
            self.dispatch(&buffer[..len], reply).await;
        }
    }

    /// Route one datagram received on the listening socket
    async fn dispatch(&self, datagram: &[u8], reply: ReplyChannel) {
        let peer = reply.peer();
        if datagram.len() < 2 {
            tracing::warn!("Packet too short from {}", peer);
            return;
        }

        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(PacketError::UnknownOpcode(opcode)) => {
                tracing::warn!("Unknown opcode {} from {}", opcode, peer);
                send_reply(&reply, Packet::error(ErrorCode::IllegalOperation, "Not understood")).await;
                return;
            }
            Err(e) => {
                tracing::warn!("Malformed packet from {}: {}", peer, e);
                return;
            }
        };

        match packet {
            Packet::ReadRequest { filename, mode } => {
                tracing::info!("RRQ for '{}' in {} mode from {}", filename, mode, peer);
                let span = tracing::info_span!("rrq", %peer, file = %filename);
                tokio::spawn(
                    serve_read(self.store.clone(), reply, filename, self.config.transfer.clone()).instrument(span),
                );
            }
            Packet::WriteRequest { filename, mode } => {
                if filename.is_empty() {
                    tracing::warn!("WRQ with empty filename from {}", peer);
                    let error = Packet::error(ErrorCode::IllegalOperation, "Zero length file name not allowed");
                    send_reply(&reply, error).await;
                    return;
                }
                tracing::info!("WRQ for '{}' in {} mode from {}", filename, mode, peer);
                let span = tracing::info_span!("wrq", %peer, file = %filename);
                tokio::spawn(
                    serve_write(self.store.clone(), reply, filename, self.config.transfer.clone()).instrument(span),
                );
            }
            Packet::Data { block, .. } => {
                tracing::warn!("DATA #{} from {} outside of a transfer", block, peer);
                send_reply(&reply, Packet::error(ErrorCode::UnknownTransferId, "Data not expected")).await;
            }
            packet @ (Packet::Ack { .. } | Packet::Error { .. }) => {
                tracing::debug!("Ignoring {} from {} outside of a transfer", packet, peer);
            }
        }
    }
}

/// Handle an RRQ: look the file up and stream it from a fresh channel
async fn serve_read(store: FileStore, reply: ReplyChannel, filename: String, config: TransferConfig) {
    let Some(contents) = store.get(&filename).await else {
        tracing::info!("File not found");
        send_reply(&reply, Packet::error(ErrorCode::FileNotFound, "File not found")).await;
        return;
    };

    let Some(mut channel) = open_channel(&reply, &config).await else {
        return;
    };

    match read_transfer(&mut channel, &contents, &config).await {
        ReadOutcome::Done => tracing::info!("Successfully transferred '{}' to {}", filename, reply.peer()),
        outcome => tracing::warn!("Failed to transfer '{}' to {}: {:?}", filename, reply.peer(), outcome),
    }
}

/// Handle a WRQ: receive the file on a fresh channel and store it once complete
async fn serve_write(store: FileStore, reply: ReplyChannel, filename: String, config: TransferConfig) {
    let Some(mut channel) = open_channel(&reply, &config).await else {
        return;
    };

    match write_transfer(&mut channel, &config).await {
        WriteOutcome::Done(contents) => {
            let len = contents.len();
            store.put(filename.clone(), contents).await;
            tracing::info!("Stored '{}' ({} bytes) from {}", filename, len, reply.peer());
        }
        outcome => tracing::warn!("Discarding '{}' from {}: {:?}", filename, reply.peer(), outcome),
    }
}

async fn open_channel(reply: &ReplyChannel, config: &TransferConfig) -> Option<UdpChannel> {
    match UdpChannel::open(reply.peer(), config.local_bind).await {
        Ok(channel) => Some(channel),
        Err(e) => {
            tracing::error!("Unable to open a local port: {}", e);
            send_reply(reply, Packet::error(ErrorCode::NotDefined, "Unable to open local port")).await;
            None
        }
    }
}

async fn send_reply(reply: &ReplyChannel, packet: Packet) {
    if let Err(e) = reply.send(&packet).await {
        tracing::warn!("Failed to reply to {}: {}", reply.peer(), e);
    }
}
