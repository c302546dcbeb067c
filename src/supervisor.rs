//! Sole owner of the peer map: dials, redials with backoff, and tracks
//! each peer's status. Nothing outside this module ever mutates the
//! map; everyone else reaches peers through the handles it hands out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::dispatcher::DispatchEvent;
use crate::error::Error;
use crate::peer::{HandshakeInfo, Peer, PeerConfig};
use crate::store::{BlockStore, BlockStoreState};

/// Capacity of the channel carrying peer lifecycle events into the
/// supervisor's single consumer loop.
pub const PEER_CHAN_CAPACITY: usize = 8;

/// Floor on redial backoff: a peer that just failed is never retried
/// sooner than this, even on its first failure.
const BACKOFF_FLOOR: Duration = Duration::from_secs(3);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// A peer's connection lifecycle, as tracked by the supervisor. Only the
/// supervisor ever constructs or mutates one.
#[derive(Debug, Clone)]
pub enum PeerStatus {
    Init,
    Connecting,
    Normal,
    Error(String),
    /// Terminal: set by [`PeerEvent::DelPeer`]. The entry stays in the
    /// map as a tombstone so a late, in-flight dial doesn't resurrect it.
    Closed,
}

/// What the supervisor's single consumer loop reacts to.
pub enum PeerEvent {
    /// Add a peer to dial, or re-request dialing one already known
    /// (idempotent: ignored if the address is already tracked).
    NewPeer(PeerConfig),
    /// Tombstone a peer by address. Does not remove its map entry.
    DelPeer(String),
    /// A dial-and-handshake attempt succeeded.
    Connected { address: String, peer: Arc<Peer> },
    /// A peer's connection ended, whether the dial failed or an
    /// already-connected peer's read task reported an error.
    ErrPeer { address: String, err: Error },
    /// Internal: a backoff timer for `address` has elapsed.
    RedialDue { address: String },
    /// Raised by the sync engine when catch-up mode completes and the
    /// engine switches to steady-state handshake/commit behavior.
    SyncFinished,
}

struct PeerEntry {
    cfg: PeerConfig,
    status: PeerStatus,
    peer: Option<Arc<Peer>>,
    attempt: u32,
    tombstoned: Arc<AtomicBool>,
}

/// Owns the peer map and the redial loop. Runs as its own task; peers
/// are reached from elsewhere only via the `Arc<Peer>` handles it hands
/// to the dispatcher through [`Connected`](PeerEvent::Connected).
pub struct Supervisor {
    peers: HashMap<String, PeerEntry>,
    peer_rx: mpsc::Receiver<PeerEvent>,
    peer_tx: mpsc::Sender<PeerEvent>,
    dispatch_tx: mpsc::Sender<DispatchEvent>,
    store: Arc<dyn BlockStore>,
    dial_timeout: Duration,
}

impl Supervisor {
    /// Takes ownership of the receiving half of an already-created
    /// `peer_chan`: the sending half must exist before the dispatcher
    /// does (the dispatcher forwards peer errors into it), so the
    /// channel itself is built by the caller, not by either task.
    pub fn new(
        dispatch_tx: mpsc::Sender<DispatchEvent>,
        peer_tx: mpsc::Sender<PeerEvent>,
        peer_rx: mpsc::Receiver<PeerEvent>,
        store: Arc<dyn BlockStore>,
        dial_timeout: Duration,
    ) -> Self {
        Supervisor {
            peers: HashMap::new(),
            peer_rx,
            peer_tx,
            dispatch_tx,
            store,
            dial_timeout,
        }
    }

    /// Status of a tracked peer, for diagnostics and tests. `None` means
    /// the address was never submitted via [`PeerEvent::NewPeer`].
    pub fn status_of(&self, address: &str) -> Option<PeerStatus> {
        self.peers.get(address).map(|e| e.status.clone())
    }

    pub async fn run(mut self) {
        while let Some(event) = self.peer_rx.recv().await {
            match event {
                PeerEvent::NewPeer(cfg) => self.on_new_peer(cfg),
                PeerEvent::DelPeer(address) => self.on_del_peer(&address).await,
                PeerEvent::Connected { address, peer } => {
                    self.on_connected(address, peer).await
                }
                PeerEvent::ErrPeer { address, err } => self.on_err_peer(address, err),
                PeerEvent::RedialDue { address } => self.on_redial_due(&address),
                PeerEvent::SyncFinished => {
                    tracing::info!("sync engine reports catch-up complete, now live");
                }
            }
        }
        tracing::debug!("supervisor channel closed, exiting");
    }

    fn on_new_peer(&mut self, cfg: PeerConfig) {
        if self.peers.contains_key(&cfg.address) {
            return;
        }
        let tombstoned = Arc::new(AtomicBool::new(false));
        self.peers.insert(
            cfg.address.clone(),
            PeerEntry {
                cfg: cfg.clone(),
                status: PeerStatus::Connecting,
                peer: None,
                attempt: 0,
                tombstoned: tombstoned.clone(),
            },
        );
        self.spawn_connect(cfg, tombstoned);
    }

    async fn on_del_peer(&mut self, address: &str) {
        if let Some(entry) = self.peers.get_mut(address) {
            entry.tombstoned.store(true, Ordering::SeqCst);
            entry.status = PeerStatus::Closed;
            if let Some(peer) = entry.peer.take() {
                peer.close().await;
            }
        }
    }

    async fn on_connected(&mut self, address: String, peer: Arc<Peer>) {
        if let Some(entry) = self.peers.get_mut(&address) {
            if matches!(entry.status, PeerStatus::Closed) {
                peer.close().await;
                return;
            }
            entry.status = PeerStatus::Normal;
            entry.attempt = 0;
            entry.peer = Some(peer);
            tracing::info!(%address, "peer connected");
        } else {
            peer.close().await;
        }
    }

    fn on_err_peer(&mut self, address: String, err: Error) {
        let Some(entry) = self.peers.get_mut(&address) else {
            return;
        };
        tracing::warn!(%address, error = %err, "peer connection ended");
        entry.peer = None;
        entry.status = PeerStatus::Error(err.to_string());
        if entry.tombstoned.load(Ordering::SeqCst) {
            return;
        }
        let attempt = entry.attempt;
        entry.attempt = entry.attempt.saturating_add(1);
        let delay = backoff_for(attempt);
        let peer_tx = self.peer_tx.clone();
        let address = address.clone();
        tokio::spawn(async move {
            futures_timer::Delay::new(delay).await;
            let _ = peer_tx.send(PeerEvent::RedialDue { address }).await;
        });
    }

    fn on_redial_due(&mut self, address: &str) {
        let Some(entry) = self.peers.get(address) else {
            return;
        };
        if entry.tombstoned.load(Ordering::SeqCst) {
            return;
        }
        self.spawn_connect(entry.cfg.clone(), entry.tombstoned.clone());
    }

    fn spawn_connect(&self, cfg: PeerConfig, tombstoned: Arc<AtomicBool>) {
        let dispatch_tx = self.dispatch_tx.clone();
        let peer_tx = self.peer_tx.clone();
        let store = self.store.clone();
        let dial_timeout = self.dial_timeout;
        tokio::spawn(async move {
            if tombstoned.load(Ordering::SeqCst) {
                return;
            }
            let address = cfg.address.clone();
            match Peer::connect(&cfg, dial_timeout, dispatch_tx).await {
                Ok(peer) => {
                    let info = handshake_info(&store.state());
                    if let Err(err) = peer.send_handshake(&info).await {
                        let _ = peer_tx.send(PeerEvent::ErrPeer { address, err }).await;
                        return;
                    }
                    let _ = peer_tx.send(PeerEvent::Connected { address, peer }).await;
                }
                Err(err) => {
                    let _ = peer_tx.send(PeerEvent::ErrPeer { address, err }).await;
                }
            }
        });
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(5);
    (BACKOFF_FLOOR * factor as u32).min(BACKOFF_CAP)
}

fn handshake_info(state: &BlockStoreState) -> HandshakeInfo {
    HandshakeInfo {
        chain_id: state.chain_id,
        head_block_num: state.head_block_num,
        head_block_id: state.head_block_id,
        head_block_time: state.head_block_time,
        last_irreversible_block_num: state.last_irreversible_block_num,
        last_irreversible_block_id: state.last_irreversible_block_id,
    }
}
