//! Per-transfer UDP channels
//!
//! Every RRQ/WRQ is served from its own ephemeral socket so that the exchange
//! never touches the well-known port after the request. [`UdpChannel`] owns
//! that socket for the lifetime of one transfer and closes it when dropped.
//! [`ReplyChannel`] answers a peer from the listening socket without opening
//! anything.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::protocol::{MAX_DATAGRAM, Packet, PacketError};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to bind ephemeral socket: {0}")]
    PortAllocation(#[source] io::Error),
    #[error("failed to send to peer: {0}")]
    Send(#[source] io::Error),
    #[error(transparent)]
    Encode(#[from] PacketError),
}

/// A packet exchange with one fixed peer
///
/// The transfer state machines are written against this trait; retry policy
/// lives with them, not with the channel.
pub trait TransferChannel {
    /// Address of the peer this channel talks to
    fn peer(&self) -> SocketAddr;

    /// Wait up to `wait` for the next packet from the peer.
    ///
    /// Returns `None` when the time elapses, or when the datagram that arrived
    /// was not a decodable TFTP packet.
    fn receive(&mut self, wait: Duration) -> impl Future<Output = Option<Packet>> + Send;

    /// Send one packet to the peer, without retrying.
    fn send(&mut self, packet: &Packet) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

/// Channel backed by a dedicated ephemeral UDP socket
#[derive(Debug)]
pub struct UdpChannel {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpChannel {
    /// Bind a fresh ephemeral socket for a transfer with `peer`.
    ///
    /// Binds to `local_bind` when given, otherwise to the unspecified address
    /// of the peer's address family.
    pub async fn open(peer: SocketAddr, local_bind: Option<IpAddr>) -> Result<Self, ChannelError> {
        let ip = local_bind.unwrap_or(match peer {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });

        let socket = UdpSocket::bind(SocketAddr::new(ip, 0))
            .await
            .map_err(ChannelError::PortAllocation)?;

        if let Ok(local) = socket.local_addr() {
            tracing::debug!("Transfer socket bound to {} for {}", local, peer);
        }
        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive a datagram from the peer, ignoring packets from other sources
    async fn recv_from_peer(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (n, src) = self.socket.recv_from(buf).await?;
            if src == self.peer {
                return Ok(n);
            }
            tracing::debug!("Ignoring datagram from {} (expecting {})", src, self.peer);
        }
    }
}

impl TransferChannel for UdpChannel {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn receive(&mut self, wait: Duration) -> Option<Packet> {
        let mut buf = [0u8; MAX_DATAGRAM];

        match timeout(wait, self.recv_from_peer(&mut buf)).await {
            Err(_) => None,
            Ok(Err(e)) => {
                tracing::warn!("Error reading from {}: {}", self.peer, e);
                None
            }
            Ok(Ok(n)) => match Packet::decode(&buf[..n]) {
                Ok(packet) => Some(packet),
                Err(e) => {
                    tracing::warn!("Malformed packet from {}: {}", self.peer, e);
                    None
                }
            },
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), ChannelError> {
        let bytes = packet.encode()?;
        self.socket
            .send_to(&bytes, self.peer)
            .await
            .map_err(ChannelError::Send)?;
        Ok(())
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        tracing::debug!("Closing transfer channel to {}", self.peer);
    }
}

/// Reply-only channel over the listening socket
///
/// Used for protocol errors answered before (or instead of) a transfer.
#[derive(Debug, Clone)]
pub struct ReplyChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl ReplyChannel {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), ChannelError> {
        let bytes = packet.encode()?;
        self.socket
            .send_to(&bytes, self.peer)
            .await
            .map_err(ChannelError::Send)?;
        Ok(())
    }
}
