//! The embedder-facing construction API: wires the wire codec, peer
//! supervisor, dispatcher and sync engine into one running client.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::dispatcher::{DispatchEvent, Dispatcher, Handler};
use crate::error::{Error, Result};
use crate::peer::{PeerConfig, DEFAULT_DIAL_TIMEOUT};
use crate::store::BlockStore;
use crate::supervisor::{PeerEvent, Supervisor};
use crate::sync::SyncEngine;
use crate::wire::types::Checksum256;

/// Builder accumulated by `With*` calls and consumed by [`Client::new`].
#[derive(Default)]
pub struct ClientOptions {
    need_sync: Option<u32>,
    handlers: Vec<Box<dyn Handler>>,
    storer: Option<Arc<dyn BlockStore>>,
    dial_timeout: Option<Duration>,
    sync_window: Option<u32>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables catch-up mode. The supplied `start_block_num` is
    /// informational only: the engine always resumes from
    /// `store.head_block_num()`, which an embedder seeds by constructing
    /// its store at that height.
    pub fn with_need_sync(mut self, start_block_num: u32) -> Self {
        self.need_sync = Some(start_block_num);
        self
    }

    /// Appends a user handler. A later call naming an already-registered
    /// handler replaces it in place.
    pub fn with_handler(mut self, handler: Box<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Required when [`with_need_sync`](Self::with_need_sync) is set.
    pub fn with_storer(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.storer = Some(store);
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    pub fn with_sync_window(mut self, window: u32) -> Self {
        self.sync_window = Some(window);
        self
    }
}

/// A running client: the dispatcher and supervisor tasks, plus the
/// channels used to feed them peer configuration and handlers.
pub struct Client {
    dispatch_tx: tokio::sync::mpsc::Sender<DispatchEvent>,
    peer_tx: tokio::sync::mpsc::Sender<PeerEvent>,
    dispatcher_task: JoinHandle<()>,
    supervisor_task: JoinHandle<()>,
}

impl Client {
    /// Validates `chain_id_hex` and `peer_cfgs`, builds the dispatcher and
    /// supervisor, registers the sync engine as the dispatcher's first
    /// handler, spawns both tasks, and dials every configured peer.
    pub fn new(chain_id_hex: &str, peer_cfgs: Vec<PeerConfig>, options: ClientOptions) -> Result<Self> {
        if peer_cfgs.is_empty() {
            return Err(Error::Config("peer list must not be empty".into()));
        }
        let chain_id = Checksum256::from_hex(chain_id_hex)?;

        let need_sync = options.need_sync.is_some();
        let store: Arc<dyn BlockStore> = match options.storer {
            Some(store) => store,
            None if need_sync => {
                return Err(Error::Config(
                    "with_need_sync requires with_storer".into(),
                ))
            }
            None => Arc::new(crate::store::InMemoryBlockStore::new(chain_id, 0)),
        };
        if store.chain_id() != chain_id {
            return Err(Error::Config(
                "configured chain id does not match the store's chain id".into(),
            ));
        }

        let dial_timeout = options.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT);

        // The peer_chan sending half must exist before the dispatcher
        // does (it forwards peer errors into it), so it's built here
        // rather than by either task's own constructor.
        let (peer_tx, peer_rx) = tokio::sync::mpsc::channel(crate::supervisor::PEER_CHAN_CAPACITY);
        let (mut dispatcher, dispatch_tx) = Dispatcher::new(peer_tx.clone());
        let supervisor = Supervisor::new(
            dispatch_tx.clone(),
            peer_tx.clone(),
            peer_rx,
            store.clone(),
            dial_timeout,
        );

        let sync_window = options.sync_window.unwrap_or(crate::sync::WINDOW);
        let sync_engine = SyncEngine::new(need_sync, store, peer_tx.clone()).with_window(sync_window);
        dispatcher.add_handler(Box::new(sync_engine));
        for handler in options.handlers {
            dispatcher.add_handler(handler);
        }

        let dispatcher_task = tokio::spawn(dispatcher.run());
        let supervisor_task = tokio::spawn(supervisor.run());

        for cfg in peer_cfgs {
            // `peer_tx` never fails here: the supervisor task owns the
            // receiving half and was just spawned above.
            let _ = peer_tx.try_send(PeerEvent::NewPeer(cfg));
        }

        Ok(Client {
            dispatch_tx,
            peer_tx,
            dispatcher_task,
            supervisor_task,
        })
    }

    /// Registers (or replaces, by name) a user handler at runtime.
    pub async fn add_handler(&self, handler: Box<dyn Handler>) {
        let _ = self.dispatch_tx.send(DispatchEvent::AddHandler(handler)).await;
    }

    pub async fn del_handler(&self, name: impl Into<String>) {
        let _ = self.dispatch_tx.send(DispatchEvent::DelHandler(name.into())).await;
    }

    /// Dials an additional peer after construction.
    pub async fn add_peer(&self, cfg: PeerConfig) {
        let _ = self.peer_tx.send(PeerEvent::NewPeer(cfg)).await;
    }

    pub async fn remove_peer(&self, address: impl Into<String>) {
        let _ = self.peer_tx.send(PeerEvent::DelPeer(address.into())).await;
    }

    /// Blocks until both the dispatcher and supervisor tasks exit
    /// (driven by dropping every sender, in practice by the embedder's
    /// own cancellation of whatever owns `Client`).
    pub async fn wait(self) {
        let _ = tokio::join!(self.dispatcher_task, self.supervisor_task);
    }
}
