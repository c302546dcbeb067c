//! The per-peer handshake/catch-up state machine. Registered as the
//! dispatcher's first handler so its state is always current before any
//! user handler sees the same packet.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::dispatcher::{Envelope, Handler};
use crate::peer::{HandshakeInfo, Peer};
use crate::store::BlockStore;
use crate::supervisor::PeerEvent;
use crate::wire::message::{GoAwayMessage, HandshakeMessage, Message, NoticeMessage, SignedBlock, TimeMessage};

/// Default width of a sync window: at most this many blocks are ever
/// outstanding in a single `SyncRequest`.
pub const WINDOW: u32 = 50;

const HANDLER_NAME: &str = "sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncMode {
    Catchup,
    Live,
}

struct PeerSyncState {
    requested_start: u32,
    requested_end: u32,
    origin_head: u32,
    mode: SyncMode,
}

/// Drives catch-up (bulk historical sync, windowed) then live (steady
/// state echo + commit) behavior, independently per peer.
pub struct SyncEngine {
    need_sync: bool,
    window: u32,
    store: Arc<dyn BlockStore>,
    peer_tx: mpsc::Sender<PeerEvent>,
    states: Mutex<HashMap<String, PeerSyncState>>,
}

impl SyncEngine {
    pub fn new(need_sync: bool, store: Arc<dyn BlockStore>, peer_tx: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            need_sync,
            window: WINDOW,
            store,
            peer_tx,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    fn initial_mode(&self) -> SyncMode {
        if self.need_sync {
            SyncMode::Catchup
        } else {
            SyncMode::Live
        }
    }

    fn mode_of(&self, address: &str) -> SyncMode {
        self.states
            .lock()
            .get(address)
            .map(|s| s.mode)
            .unwrap_or_else(|| self.initial_mode())
    }

    async fn on_handshake(&self, envelope: &Envelope, msg: &HandshakeMessage) {
        let address = envelope.sender.address().to_string();
        let mode = {
            let mut states = self.states.lock();
            let state = states.entry(address.clone()).or_insert_with(|| PeerSyncState {
                requested_start: 0,
                requested_end: 0,
                origin_head: 0,
                mode: self.initial_mode(),
            });
            state.origin_head = msg.head_num;
            state.mode
        };

        match mode {
            SyncMode::Catchup => {
                if let Err(err) = self.send_sync_request(&envelope.sender, &address).await {
                    tracing::warn!(%address, error = %err, "sync request write failed, closing peer");
                    envelope.sender.close().await;
                }
            }
            SyncMode::Live => {
                let echo = HandshakeMessage {
                    node_id: envelope.sender.node_id(),
                    p2p_address: envelope.sender.name().to_string(),
                    ..msg.clone()
                };
                if let Err(err) = envelope.sender.send_message(&Message::Handshake(echo)).await {
                    tracing::warn!(%address, error = %err, "handshake echo failed, closing peer");
                    envelope.sender.close().await;
                }
            }
        }
    }

    async fn on_notice(&self, envelope: &Envelope, msg: &NoticeMessage) {
        if self.mode_of(envelope.sender.address()) != SyncMode::Catchup {
            return;
        }
        if msg.known_blocks.pending == 0 {
            return;
        }
        let address = envelope.sender.address().to_string();
        {
            let mut states = self.states.lock();
            let state = states.entry(address.clone()).or_insert_with(|| PeerSyncState {
                requested_start: 0,
                requested_end: 0,
                origin_head: 0,
                mode: self.initial_mode(),
            });
            state.origin_head = msg.known_blocks.pending;
        }
        if let Err(err) = self.send_sync_request(&envelope.sender, &address).await {
            tracing::warn!(%address, error = %err, "sync request write failed, closing peer");
            envelope.sender.close().await;
        }
    }

    async fn on_signed_block(&self, envelope: &Envelope, block: &SignedBlock) {
        let address = envelope.sender.address().to_string();
        if let Err(err) = self.store.commit_block(block.clone()).await {
            tracing::warn!(%address, error = %err, "block store commit failed");
        }

        if self.mode_of(&address) != SyncMode::Catchup {
            return;
        }

        let n = block.block_number;
        let (requested_end, origin_head) = {
            let states = self.states.lock();
            match states.get(&address) {
                Some(s) => (s.requested_end, s.origin_head),
                None => return,
            }
        };

        if n < requested_end {
            return;
        }

        if n == requested_end && origin_head <= n {
            {
                let mut states = self.states.lock();
                if let Some(s) = states.get_mut(&address) {
                    s.mode = SyncMode::Live;
                }
            }
            let store_state = self.store.state();
            let info = HandshakeInfo {
                chain_id: store_state.chain_id,
                head_block_num: n,
                head_block_id: block.block_id,
                head_block_time: block.timestamp,
                last_irreversible_block_num: store_state.last_irreversible_block_num,
                last_irreversible_block_id: store_state.last_irreversible_block_id,
            };
            if let Err(err) = envelope.sender.send_handshake(&info).await {
                tracing::warn!(%address, error = %err, "post-catch-up handshake failed");
            }
            let _ = self.peer_tx.send(PeerEvent::SyncFinished).await;
            return;
        }

        if n == requested_end && origin_head > n {
            if let Err(err) = self.send_sync_request(&envelope.sender, &address).await {
                tracing::warn!(%address, error = %err, "sync request write failed, closing peer");
                envelope.sender.close().await;
            }
        }
    }

    async fn on_go_away(&self, envelope: &Envelope, msg: &GoAwayMessage) {
        tracing::info!(peer = envelope.sender.name(), reason = ?msg.reason, "peer requested disconnect");
        envelope.sender.close().await;
    }

    async fn on_time(&self, envelope: &Envelope, msg: &TimeMessage) {
        let _ = envelope.sender.send_time(Some(*msg)).await;
    }

    /// `requested_start ← store.head_block_num()`, window capped at
    /// `self.window`, wire end is exclusive.
    async fn send_sync_request(&self, peer: &Arc<Peer>, address: &str) -> crate::error::Result<()> {
        let head = self.store.head_block_num();
        let (start, end) = {
            let mut states = self.states.lock();
            let state = states.entry(address.to_string()).or_insert_with(|| PeerSyncState {
                requested_start: head,
                requested_end: head,
                origin_head: head,
                mode: SyncMode::Catchup,
            });
            let span = state.origin_head.saturating_sub(head).min(self.window);
            state.requested_start = head;
            state.requested_end = head + span;
            (state.requested_start, state.requested_end)
        };
        peer.send_sync_request(start, end + 1).await
    }
}

#[async_trait::async_trait]
impl Handler for SyncEngine {
    fn name(&self) -> &str {
        HANDLER_NAME
    }

    async fn handle(&self, envelope: &Envelope) {
        match &envelope.packet.message {
            Message::Handshake(m) => self.on_handshake(envelope, m).await,
            Message::Notice(m) => self.on_notice(envelope, m).await,
            Message::SignedBlock(b) => self.on_signed_block(envelope, b).await,
            Message::GoAway(m) => self.on_go_away(envelope, m).await,
            Message::Time(m) => self.on_time(envelope, m).await,
            Message::Request(_) | Message::SyncRequest(_) | Message::PackedTransaction(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBlockStore;
    use crate::wire::types::Checksum256;
    use tokio::net::TcpListener;
    use tokio::time::Duration;

    async fn connected_pair() -> (Arc<Peer>, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let (dispatch_tx, _rx) = mpsc::channel(8);
        let cfg = crate::peer::PeerConfig {
            name: None,
            address: addr.to_string(),
        };
        let peer = Peer::connect(&cfg, Duration::from_secs(1), dispatch_tx)
            .await
            .unwrap();
        let server_side = accept.await.unwrap();
        (peer, server_side)
    }

    #[tokio::test]
    async fn single_window_catch_up_requests_exactly_the_announced_head() {
        let store = Arc::new(InMemoryBlockStore::new(Checksum256::zero(), 1));
        let (peer_tx, _peer_rx) = mpsc::channel(8);
        let engine = SyncEngine::new(true, store, peer_tx);

        let (peer, mut server_side) = connected_pair().await;
        let envelope = Envelope {
            sender: peer,
            packet: crate::wire::Packet {
                message_type: crate::wire::MessageType::Handshake,
                message: Message::Handshake(HandshakeMessage {
                    network_version: 1206,
                    chain_id: Checksum256::zero(),
                    node_id: Checksum256([1; 32]),
                    key: crate::wire::types::PublicKey::sentinel(),
                    time: crate::wire::types::Timestamp::zero(),
                    token: Checksum256::zero(),
                    sig: crate::wire::types::Signature::zero(),
                    p2p_address: "peer-a".into(),
                    last_irreversible_block_num: 0,
                    last_irreversible_block_id: Checksum256::zero(),
                    head_num: 10,
                    head_id: Checksum256::zero(),
                    os: "linux".into(),
                    agent: "test".into(),
                    generation: 1,
                }),
                raw: Vec::new(),
            },
        };

        engine.handle(&envelope).await;

        let packet = crate::wire::read_packet(&mut server_side).await.unwrap();
        match packet.message {
            Message::SyncRequest(m) => {
                assert_eq!(m.start_block, 1);
                assert_eq!(m.end_block, 11);
            }
            _ => panic!("expected a sync request"),
        }
    }

    #[tokio::test]
    async fn notice_pending_triggers_a_sync_request() {
        let store = Arc::new(InMemoryBlockStore::new(Checksum256::zero(), 5));
        let (peer_tx, _peer_rx) = mpsc::channel(8);
        let engine = SyncEngine::new(true, store, peer_tx);

        let (peer, mut server_side) = connected_pair().await;
        let envelope = Envelope {
            sender: peer,
            packet: crate::wire::Packet {
                message_type: crate::wire::MessageType::Notice,
                message: Message::Notice(NoticeMessage {
                    known_trx: Default::default(),
                    known_blocks: crate::wire::message::BlockIdRange {
                        mode: None,
                        pending: 42,
                        ids: Vec::new(),
                    },
                }),
                raw: Vec::new(),
            },
        };

        engine.handle(&envelope).await;

        let packet = crate::wire::read_packet(&mut server_side).await.unwrap();
        match packet.message {
            Message::SyncRequest(m) => {
                assert_eq!(m.start_block, 5);
                assert_eq!(m.end_block, 43);
            }
            _ => panic!("expected a sync request"),
        }
    }
}
