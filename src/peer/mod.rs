//! One logical outbound connection: dialing, atomic sends, and the
//! per-peer read loop that feeds the dispatcher.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::dispatcher::DispatchEvent;
use crate::error::{Error, Result};
use crate::wire::message::{
    GoAwayMessage, GoAwayReason, HandshakeMessage, Message, SyncRequestMessage, TimeMessage,
};
use crate::wire::types::{Checksum256, PublicKey, Signature, Timestamp};
use crate::wire::{self};

/// Default socket-level connect timeout, per peer.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// The wire protocol version advertised in every handshake this client
/// sends.
pub const NETWORK_VERSION: u16 = 1206;

/// How a peer is addressed and (optionally) named by the embedder.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub name: Option<String>,
    pub address: String,
}

/// Fields carried in every handshake this client sends: chain id,
/// current head and last-irreversible block.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeInfo {
    pub chain_id: Checksum256,
    pub head_block_num: u32,
    pub head_block_id: Checksum256,
    pub head_block_time: Timestamp,
    pub last_irreversible_block_num: u32,
    pub last_irreversible_block_id: Checksum256,
}

/// One logical outbound connection. The node id is drawn once, at
/// construction, and never mutates; the address is the key used to
/// identify this peer across the dispatcher and supervisor channels.
pub struct Peer {
    address: Arc<str>,
    name: String,
    node_id: Checksum256,
    generation: AtomicU32,
    writer: AsyncMutex<OwnedWriteHalf>,
    dispatch_tx: mpsc::Sender<DispatchEvent>,
}

impl Peer {
    /// Dials `cfg.address`, completing within `timeout` or failing with
    /// [`Error::DialTimeout`]/[`Error::Io`]. On success, spawns this
    /// peer's single read task and returns a shared handle to it.
    pub async fn connect(
        cfg: &PeerConfig,
        timeout: Duration,
        dispatch_tx: mpsc::Sender<DispatchEvent>,
    ) -> Result<Arc<Peer>> {
        let stream = dial(&cfg.address, timeout).await?;
        let (read_half, write_half) = stream.into_split();

        let node_id = Checksum256(rand::random());
        let name = cfg
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| default_name(&node_id));

        let peer = Arc::new(Peer {
            address: Arc::from(cfg.address.as_str()),
            name,
            node_id,
            generation: AtomicU32::new(0),
            writer: AsyncMutex::new(write_half),
            dispatch_tx,
        });

        tokio::spawn(run_read_loop(peer.clone(), read_half));
        Ok(peer)
    }

    pub fn address(&self) -> &Arc<str> {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_id(&self) -> Checksum256 {
        self.node_id
    }

    /// Encodes and writes `message` in one call; no partial write is ever
    /// observable by the peer.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        wire::write_packet(&mut *writer, message).await
    }

    /// Sends a handshake built from `info`, with a fixed dummy public key
    /// and zero signature: this peer is an unsigned observer, and the
    /// chain protocol permits that.
    pub async fn send_handshake(&self, info: &HandshakeInfo) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) as i16 + 1;
        let msg = Message::Handshake(HandshakeMessage {
            network_version: NETWORK_VERSION,
            chain_id: info.chain_id,
            node_id: self.node_id,
            key: PublicKey::sentinel(),
            time: Timestamp::zero(),
            token: Checksum256::zero(),
            sig: Signature::zero(),
            p2p_address: self.name.clone(),
            last_irreversible_block_num: info.last_irreversible_block_num,
            last_irreversible_block_id: info.last_irreversible_block_id,
            head_num: info.head_block_num,
            head_id: info.head_block_id,
            os: std::env::consts::OS.to_string(),
            agent: "eosio-p2p-core".to_string(),
            generation,
        });
        self.send_message(&msg).await
    }

    /// `end` is inclusive from the engine's point of view; the wire
    /// encoding is exclusive, so callers pass `requested_end + 1`.
    pub async fn send_sync_request(&self, start: u32, end_exclusive: u32) -> Result<()> {
        let msg = Message::SyncRequest(SyncRequestMessage {
            start_block: start,
            end_block: end_exclusive,
        });
        self.send_message(&msg).await
    }

    /// If `echo` is present, replies with a filled-in time message;
    /// otherwise sends an empty one.
    pub async fn send_time(&self, echo: Option<TimeMessage>) -> Result<()> {
        let msg = match echo {
            Some(echo) => TimeMessage {
                origin: echo.transmit,
                receive: echo.destination_placeholder(),
                transmit: now_micros(),
            },
            None => TimeMessage::default(),
        };
        self.send_message(&Message::Time(msg)).await
    }

    pub async fn send_go_away(&self, reason: GoAwayReason) -> Result<()> {
        let msg = Message::GoAway(GoAwayMessage {
            reason,
            node_id: self.node_id,
        });
        self.send_message(&msg).await
    }

    /// Shuts the write half down. Idempotent: a second call observes an
    /// already-closed socket and returns `Ok(())`.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address)
            .field("name", &self.name)
            .finish()
    }
}

trait TimeMessageExt {
    fn destination_placeholder(&self) -> Timestamp;
}

impl TimeMessageExt for TimeMessage {
    // `destination` isn't separately tracked by this client (it never
    // serves requests), so the receive leg of the echo is stamped with
    // the same clock read used for `transmit`.
    fn destination_placeholder(&self) -> Timestamp {
        now_micros()
    }
}

fn now_micros() -> Timestamp {
    let micros = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    Timestamp(micros)
}

fn default_name(node_id: &Checksum256) -> String {
    format!(
        "ClientPeer-{:02x}{:02x}{:02x}{:02x}",
        node_id.0[0], node_id.0[1], node_id.0[2], node_id.0[3]
    )
}

async fn dial(address: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::DialTimeout {
            address: address.to_string(),
            timeout,
        }),
    }
}

/// The single task owned by this peer: reads packets until the
/// connection ends, reporting every outcome (including normal
/// end-of-stream, and an unwind) to the dispatcher exactly once.
async fn run_read_loop(peer: Arc<Peer>, mut reader: OwnedReadHalf) {
    struct ReportOnDrop {
        peer: Arc<Peer>,
        reported: bool,
    }

    impl Drop for ReportOnDrop {
        fn drop(&mut self) {
            if !self.reported {
                let _ = self.peer.dispatch_tx.try_send(DispatchEvent::Error {
                    sender: self.peer.clone(),
                    err: Error::TaskPanicked,
                });
            }
        }
    }

    let mut guard = ReportOnDrop {
        peer: peer.clone(),
        reported: false,
    };

    loop {
        match wire::read_packet(&mut reader).await {
            Ok(packet) => {
                let sent = peer
                    .dispatch_tx
                    .send(DispatchEvent::Packet {
                        sender: peer.clone(),
                        packet,
                    })
                    .await;
                if sent.is_err() {
                    // dispatcher already shut down; nothing left to report.
                    guard.reported = true;
                    return;
                }
            }
            Err(err) => {
                let err = normalize_eof(err);
                let _ = peer
                    .dispatch_tx
                    .send(DispatchEvent::Error {
                        sender: peer.clone(),
                        err,
                    })
                    .await;
                guard.reported = true;
                return;
            }
        }
    }
}

fn normalize_eof(err: Error) -> Error {
    match err {
        Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Error::EndOfStream
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_uses_first_four_bytes() {
        let node_id = Checksum256([0xAB, 0xCD, 0xEF, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(default_name(&node_id), "ClientPeer-abcdef01");
    }

    #[tokio::test]
    async fn dial_times_out_against_an_unroutable_address() {
        // 10.255.255.1 is conventionally unroutable in CI sandboxes and
        // test environments; this exercises the timeout path without a
        // real listener.
        let result = dial("10.255.255.1:1", Duration::from_millis(50)).await;
        assert!(result.is_err());
    }
}
