//! TFTP File Transfer Logic
//!
//! This module drives the two transfer state machines over a
//! [`TransferChannel`]:
//!
//! - [`read_transfer`] streams a file to the peer one block at a time, resending
//!   each block until it is acknowledged or its deadline passes.
//! - [`write_transfer`] accepts blocks from the peer, re-acknowledging
//!   duplicates, until the terminal short block arrives.
//!
//! Only one block is ever in flight. Deadlines are measured on the Tokio clock.

use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::channel::{ChannelError, TransferChannel};
use crate::protocol::{BLOCK_SIZE, ErrorCode, Packet};

const ACK_TIMEOUT_SECS: u64 = 10;
const BLOCK_DEADLINE_SECS: u64 = 30;
const DATA_TIMEOUT_SECS: u64 = 2;
const WRITE_DEADLINE_SECS: u64 = 30;

/// Message sent to the peer when a block could not be delivered
pub const SEND_FAILED: &str = "Send failed";

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long a read transfer waits for each ACK before resending
    pub ack_timeout: Duration,
    /// Total time a read transfer spends on one block before giving up
    pub block_deadline: Duration,
    /// How long a write transfer waits for data before re-acknowledging
    pub data_timeout: Duration,
    /// Time a write transfer may go without a new block before giving up
    pub write_deadline: Duration,
    /// Local address for transfer sockets
    pub local_bind: Option<IpAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(ACK_TIMEOUT_SECS),
            block_deadline: Duration::from_secs(BLOCK_DEADLINE_SECS),
            data_timeout: Duration::from_secs(DATA_TIMEOUT_SECS),
            write_deadline: Duration::from_secs(WRITE_DEADLINE_SECS),
            local_bind: None,
        }
    }
}

/// How a read transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The terminal block was acknowledged
    Done,
    /// The peer sent an ERROR packet
    PrematureTermination,
    /// A DATA packet could not be sent
    SendFailed,
    /// A block went unacknowledged past its deadline
    TimedOut,
}

/// How a write transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The terminal block arrived; holds the assembled file
    Done(Vec<u8>),
    /// The peer sent an ERROR packet
    PrematureTermination,
    /// No new block arrived before the deadline
    TimedOut,
}

/// Result of trying to get one block acknowledged
#[derive(Debug)]
enum Delivery {
    Acked,
    PeerError { code: u16, message: String },
    SendFailed(ChannelError),
    Expired,
}

/// Result of one receive step of a write transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Terminal block accepted
    Finished,
    /// Peer sent an error
    Aborted,
    /// Expected block accepted, more follow
    Accepted,
    /// Nothing useful arrived
    Waiting,
}

/// Split file content into numbered blocks.
///
/// Content that is a multiple of [`BLOCK_SIZE`] long (including empty content)
/// ends with an empty block, so the last block is always short.
fn blocks(content: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let count = content.len() / BLOCK_SIZE + 1;
    (0..count).map(move |i| {
        let start = i * BLOCK_SIZE;
        let end = std::cmp::min(start + BLOCK_SIZE, content.len());
        // Block numbers wrap at 65536, as on the wire
        ((i + 1) as u16, &content[start..end])
    })
}

/// Serve `content` to the channel's peer
pub async fn read_transfer<C: TransferChannel>(
    channel: &mut C,
    content: &[u8],
    config: &TransferConfig,
) -> ReadOutcome {
    tracing::info!("Start read of {} bytes", content.len());

    for (block, chunk) in blocks(content) {
        match deliver_block(channel, block, chunk, config).await {
            Delivery::Acked => {}
            Delivery::PeerError { code, message } => {
                tracing::warn!("Read terminated by peer at block {}: {} - {}", block, code, message);
                return ReadOutcome::PrematureTermination;
            }
            Delivery::SendFailed(e) => {
                tracing::warn!("Failed to send block {}: {}", block, e);
                send_failure(channel).await;
                return ReadOutcome::SendFailed;
            }
            Delivery::Expired => {
                tracing::warn!("No ACK received for block {}; giving up", block);
                send_failure(channel).await;
                return ReadOutcome::TimedOut;
            }
        }
    }

    tracing::info!("End read");
    ReadOutcome::Done
}

/// Send a data block and wait for its ACK, resending until the block deadline
async fn deliver_block<C: TransferChannel>(
    channel: &mut C,
    block: u16,
    chunk: &[u8],
    config: &TransferConfig,
) -> Delivery {
    let packet = Packet::data(block, chunk);
    let deadline = Instant::now() + config.block_deadline;
    let mut attempt = 0u32;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Delivery::Expired;
        }

        attempt += 1;
        if attempt > 1 {
            tracing::debug!("Resending block {} (attempt {})", block, attempt);
        }
        if let Err(e) = channel.send(&packet).await {
            return Delivery::SendFailed(e);
        }

        let wait = config.ack_timeout.min(deadline - now);
        match channel.receive(wait).await {
            Some(Packet::Ack { block: acked }) if acked == block => return Delivery::Acked,
            Some(Packet::Error { code, message }) => return Delivery::PeerError { code, message },
            Some(other) => tracing::debug!("Unexpected {} while waiting for ACK #{}", other, block),
            None => tracing::debug!("ACK #{} not received", block),
        }
    }
}

async fn send_failure<C: TransferChannel>(channel: &mut C) {
    let packet = Packet::error(ErrorCode::UnknownTransferId, SEND_FAILED);
    if let Err(e) = channel.send(&packet).await {
        tracing::debug!("Could not report failure to {}: {}", channel.peer(), e);
    }
}

/// Receive a file from the channel's peer
///
/// Acknowledges the request with ACK 0 first. The assembled content is only
/// returned once the terminal block has been accepted.
pub async fn write_transfer<C: TransferChannel>(channel: &mut C, config: &TransferConfig) -> WriteOutcome {
    tracing::info!("Start write");
    send_ack(channel, 0).await;

    let mut content = Vec::new();
    let mut expected: u16 = 1;
    let mut deadline = Instant::now() + config.write_deadline;

    loop {
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!("Write timed out waiting for block {}", expected);
            return WriteOutcome::TimedOut;
        }

        let wait = config.data_timeout.min(deadline - now);
        match receive_block(channel, &mut content, expected, wait).await {
            Step::Finished => {
                tracing::info!("End write of {} bytes", content.len());
                return WriteOutcome::Done(content);
            }
            Step::Aborted => {
                tracing::warn!("Write terminated by peer at block {}", expected);
                return WriteOutcome::PrematureTermination;
            }
            Step::Accepted => {
                expected = expected.wrapping_add(1);
                deadline = Instant::now() + config.write_deadline;
            }
            Step::Waiting => {}
        }
    }
}

async fn receive_block<C: TransferChannel>(
    channel: &mut C,
    content: &mut Vec<u8>,
    expected: u16,
    wait: Duration,
) -> Step {
    match channel.receive(wait).await {
        None => {
            // The previous ACK may have been lost
            send_ack(channel, expected.wrapping_sub(1)).await;
            Step::Waiting
        }
        Some(Packet::Error { code, message }) => {
            tracing::debug!("Peer error {}: {}", code, message);
            Step::Aborted
        }
        Some(Packet::Data { block, payload }) if block == expected => {
            content.extend_from_slice(&payload);
            send_ack(channel, block).await;
            if payload.len() < BLOCK_SIZE {
                Step::Finished
            } else {
                Step::Accepted
            }
        }
        Some(Packet::Data { block, .. }) if block < expected => {
            tracing::debug!("Duplicate block {} (expecting {})", block, expected);
            send_ack(channel, block).await;
            Step::Waiting
        }
        Some(other) => {
            tracing::debug!("Ignoring {} while waiting for block {}", other, expected);
            Step::Waiting
        }
    }
}

async fn send_ack<C: TransferChannel>(channel: &mut C, block: u16) {
    // A lost ACK is recovered by the peer retransmitting
    if let Err(e) = channel.send(&Packet::ack(block)).await {
        tracing::warn!("Failed to send ACK #{}: {}", block, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::scripted::ScriptedChannel;

    fn acks(sent: &[Packet]) -> Vec<u16> {
        sent.iter()
            .map(|p| match p {
                Packet::Ack { block } => *block,
                other => panic!("expected ACK, got {other:?}"),
            })
            .collect()
    }

    fn send_failed() -> Packet {
        Packet::error(ErrorCode::UnknownTransferId, SEND_FAILED)
    }

    #[test]
    fn test_transfer_config_default() {
        let config = TransferConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(ACK_TIMEOUT_SECS));
        assert_eq!(config.block_deadline, Duration::from_secs(BLOCK_DEADLINE_SECS));
        assert_eq!(config.data_timeout, Duration::from_secs(DATA_TIMEOUT_SECS));
        assert_eq!(config.write_deadline, Duration::from_secs(WRITE_DEADLINE_SECS));
        assert!(config.local_bind.is_none());
    }

    #[test]
    fn test_blocks_partitioning() {
        let empty: Vec<_> = blocks(&[]).collect();
        assert_eq!(empty, vec![(1, &[][..])]);

        let data = vec![1u8; BLOCK_SIZE + 10];
        let sizes: Vec<_> = blocks(&data).map(|(n, b)| (n, b.len())).collect();
        assert_eq!(sizes, vec![(1, BLOCK_SIZE), (2, 10)]);

        let data = vec![1u8; BLOCK_SIZE * 2];
        let sizes: Vec<_> = blocks(&data).map(|(n, b)| (n, b.len())).collect();
        assert_eq!(sizes, vec![(1, BLOCK_SIZE), (2, BLOCK_SIZE), (3, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_empty_file() {
        let mut channel = ScriptedChannel::new([Some(Packet::ack(1))]);

        let outcome = read_transfer(&mut channel, &[], &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::Done);
        assert_eq!(channel.sent, vec![Packet::data(1, Vec::new())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_one_under_block_size() {
        let file = vec![b'1'; BLOCK_SIZE - 1];
        let mut channel = ScriptedChannel::new([Some(Packet::ack(1))]);

        let outcome = read_transfer(&mut channel, &file, &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::Done);
        assert_eq!(channel.sent, vec![Packet::data(1, file)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_exactly_one_block() {
        let file = vec![b'1'; BLOCK_SIZE];
        let mut channel = ScriptedChannel::new([Some(Packet::ack(1)), Some(Packet::ack(2))]);

        let outcome = read_transfer(&mut channel, &file, &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::Done);
        assert_eq!(channel.sent, vec![Packet::data(1, file), Packet::data(2, Vec::new())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_multiple_blocks() {
        let file: Vec<u8> = (0..1300u32).map(|i| i as u8).collect();
        let mut channel = ScriptedChannel::new([Some(Packet::ack(1)), Some(Packet::ack(2)), Some(Packet::ack(3))]);

        let outcome = read_transfer(&mut channel, &file, &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::Done);
        assert_eq!(
            channel.sent,
            vec![
                Packet::data(1, &file[..512]),
                Packet::data(2, &file[512..1024]),
                Packet::data(3, &file[1024..]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_retries_after_timeout() {
        let mut channel = ScriptedChannel::new([None, Some(Packet::ack(1))]);

        let outcome = read_transfer(&mut channel, &[], &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::Done);
        assert_eq!(channel.sent, vec![Packet::data(1, Vec::new()), Packet::data(1, Vec::new())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_retries_on_wrong_ack() {
        let mut channel = ScriptedChannel::new([
            Some(Packet::ack(7)),
            Some(Packet::data(1, Vec::new())),
            Some(Packet::ack(1)),
        ]);

        let outcome = read_transfer(&mut channel, b"abc", &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::Done);
        assert_eq!(channel.sent, vec![Packet::data(1, b"abc".to_vec()); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_exhausts_block_deadline() {
        let mut channel = ScriptedChannel::new([]);
        let start = Instant::now();

        let outcome = read_transfer(&mut channel, &[], &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(BLOCK_DEADLINE_SECS));
        // Sent at 0s, 10s and 20s, then reported at 30s
        assert_eq!(
            channel.sent,
            vec![
                Packet::data(1, Vec::new()),
                Packet::data(1, Vec::new()),
                Packet::data(1, Vec::new()),
                send_failed(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_premature_termination() {
        let file = vec![b'x'; BLOCK_SIZE + 1];
        let mut channel = ScriptedChannel::new([
            Some(Packet::ack(1)),
            Some(Packet::error(ErrorCode::DiskFull, "Disk full")),
        ]);

        let outcome = read_transfer(&mut channel, &file, &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::PrematureTermination);
        assert_eq!(
            channel.sent,
            vec![Packet::data(1, &file[..BLOCK_SIZE]), Packet::data(2, &file[BLOCK_SIZE..])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_send_failure_is_reported() {
        let mut channel = ScriptedChannel::new([Some(Packet::ack(1))]);
        channel.fail_sends = 1;

        let outcome = read_transfer(&mut channel, b"abc", &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::SendFailed);
        // DATA #1 was lost, the failure report got through
        assert_eq!(channel.sent, vec![send_failed()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_all_sends_failing() {
        let mut channel = ScriptedChannel::new([Some(Packet::ack(1))]);
        channel.fail_sends = 2;

        let outcome = read_transfer(&mut channel, b"abc", &TransferConfig::default()).await;

        assert_eq!(outcome, ReadOutcome::SendFailed);
        assert!(channel.sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_empty_file() {
        let mut channel = ScriptedChannel::new([Some(Packet::data(1, Vec::new()))]);

        let outcome = write_transfer(&mut channel, &TransferConfig::default()).await;

        assert_eq!(outcome, WriteOutcome::Done(Vec::new()));
        assert_eq!(acks(&channel.sent), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_file_of_block_size() {
        let file = b"12345678".repeat(64);
        let mut channel = ScriptedChannel::new([
            Some(Packet::data(1, file.clone())),
            Some(Packet::data(2, Vec::new())),
        ]);

        let outcome = write_transfer(&mut channel, &TransferConfig::default()).await;

        assert_eq!(outcome, WriteOutcome::Done(file));
        assert_eq!(acks(&channel.sent), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_duplicate_block_is_acked_once_stored() {
        let file = b"12345678".repeat(64);
        let mut channel = ScriptedChannel::new([
            Some(Packet::data(1, file.clone())),
            Some(Packet::data(1, file.clone())),
            Some(Packet::data(2, Vec::new())),
        ]);

        let outcome = write_transfer(&mut channel, &TransferConfig::default()).await;

        assert_eq!(outcome, WriteOutcome::Done(file));
        assert_eq!(acks(&channel.sent), vec![0, 1, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_acks_the_duplicate_itself() {
        let block = vec![b'a'; BLOCK_SIZE];
        let mut channel = ScriptedChannel::new([
            Some(Packet::data(1, block.clone())),
            Some(Packet::data(2, block.clone())),
            Some(Packet::data(1, block.clone())),
            Some(Packet::data(3, b"end".to_vec())),
        ]);

        let outcome = write_transfer(&mut channel, &TransferConfig::default()).await;

        let mut expected = block.repeat(2);
        expected.extend_from_slice(b"end");
        assert_eq!(outcome, WriteOutcome::Done(expected));
        assert_eq!(acks(&channel.sent), vec![0, 1, 2, 1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_reacks_after_timeout() {
        let mut channel = ScriptedChannel::new([None, Some(Packet::data(1, b"hi".to_vec()))]);

        let outcome = write_transfer(&mut channel, &TransferConfig::default()).await;

        assert_eq!(outcome, WriteOutcome::Done(b"hi".to_vec()));
        assert_eq!(acks(&channel.sent), vec![0, 0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_ignores_blocks_from_the_future() {
        let mut channel = ScriptedChannel::new([
            Some(Packet::data(3, b"zz".to_vec())),
            Some(Packet::data(1, b"ok".to_vec())),
        ]);

        let outcome = write_transfer(&mut channel, &TransferConfig::default()).await;

        assert_eq!(outcome, WriteOutcome::Done(b"ok".to_vec()));
        assert_eq!(acks(&channel.sent), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_premature_termination() {
        let mut channel = ScriptedChannel::new([
            Some(Packet::data(1, vec![0; BLOCK_SIZE])),
            Some(Packet::error(ErrorCode::NotDefined, "cancelled")),
        ]);

        let outcome = write_transfer(&mut channel, &TransferConfig::default()).await;

        assert_eq!(outcome, WriteOutcome::PrematureTermination);
        assert_eq!(acks(&channel.sent), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_times_out() {
        let mut channel = ScriptedChannel::new([Some(Packet::data(1, vec![0; BLOCK_SIZE]))]);
        let start = Instant::now();

        let outcome = write_transfer(&mut channel, &TransferConfig::default()).await;

        assert_eq!(outcome, WriteOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(WRITE_DEADLINE_SECS));

        let sent = acks(&channel.sent);
        assert_eq!(&sent[..2], &[0, 1]);
        // Re-acknowledged every data timeout until the deadline
        assert_eq!(sent.len(), 2 + (WRITE_DEADLINE_SECS / DATA_TIMEOUT_SECS) as usize);
        assert!(sent[2..].iter().all(|&b| b == 1));
    }
}
