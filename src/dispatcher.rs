//! The single consumer of every peer's packet stream: one channel in,
//! an ordered list of handlers fanned out to, peer errors forwarded to
//! the supervisor.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::peer::Peer;
use crate::supervisor::PeerEvent;
use crate::wire::Packet;

/// Capacity of the channel every peer's read task pushes packets and
/// errors into. Deliberately small: a slow dispatcher should exert back
/// pressure on peers, not buffer unboundedly.
pub const PACKET_CHAN_CAPACITY: usize = 256;

/// A packet paired with the peer it arrived from. Cheap to clone: the
/// peer handle is an `Arc` and the packet itself is already decoded.
#[derive(Clone)]
pub struct Envelope {
    pub sender: Arc<Peer>,
    pub packet: Packet,
}

/// Something the dispatcher's single consumer loop reacts to.
pub enum DispatchEvent {
    /// Register or replace (by name) a handler. Replacement preserves
    /// the replaced handler's position in the list.
    AddHandler(Box<dyn Handler>),
    DelHandler(String),
    Packet { sender: Arc<Peer>, packet: Packet },
    Error { sender: Arc<Peer>, err: Error },
}

/// One consumer of dispatched packets. Handlers run in registration
/// order and are never run concurrently with each other: a slow
/// handler delays the ones behind it, by design, since ordering (the
/// sync engine first) is part of the contract.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &Envelope);
}

/// Owns the handler list and the packet channel. There is exactly one
/// dispatcher per client, running as its own task.
pub struct Dispatcher {
    handlers: Vec<Box<dyn Handler>>,
    packet_rx: mpsc::Receiver<DispatchEvent>,
    peer_tx: mpsc::Sender<PeerEvent>,
}

impl Dispatcher {
    pub fn new(peer_tx: mpsc::Sender<PeerEvent>) -> (Self, mpsc::Sender<DispatchEvent>) {
        let (tx, rx) = mpsc::channel(PACKET_CHAN_CAPACITY);
        (
            Dispatcher {
                handlers: Vec::new(),
                packet_rx: rx,
                peer_tx,
            },
            tx,
        )
    }

    /// Registers `handler`, replacing any existing handler with the same
    /// name in place. Call before `run` for handlers that must precede
    /// everything dispatched at runtime (the sync engine).
    pub fn add_handler(&mut self, handler: Box<dyn Handler>) {
        if let Some(slot) = self.handlers.iter_mut().find(|h| h.name() == handler.name()) {
            *slot = handler;
        } else {
            self.handlers.push(handler);
        }
    }

    fn del_handler(&mut self, name: &str) {
        self.handlers.retain(|h| h.name() != name);
    }

    /// Consumes dispatch events until the channel is closed (every
    /// sender, including every peer's read task, has dropped).
    pub async fn run(mut self) {
        while let Some(event) = self.packet_rx.recv().await {
            match event {
                DispatchEvent::AddHandler(handler) => {
                    tracing::debug!(name = handler.name(), "handler registered");
                    self.add_handler(handler);
                }
                DispatchEvent::DelHandler(name) => {
                    tracing::debug!(%name, "handler removed");
                    self.del_handler(&name);
                }
                DispatchEvent::Packet { sender, packet } => {
                    let envelope = Envelope { sender, packet };
                    for handler in &self.handlers {
                        handler.handle(&envelope).await;
                    }
                }
                DispatchEvent::Error { sender, err } => {
                    tracing::debug!(peer = sender.name(), error = %err, "peer read task ended");
                    let _ = self
                        .peer_tx
                        .send(PeerEvent::ErrPeer {
                            address: sender.address().to_string(),
                            err,
                        })
                        .await;
                }
            }
        }
        tracing::debug!("dispatcher channel closed, exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::time::Duration;

    struct CountingHandler {
        name: String,
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Handler for CountingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, _envelope: &Envelope) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn loopback_peer(dispatch_tx: mpsc::Sender<DispatchEvent>) -> Arc<Peer> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let cfg = crate::peer::PeerConfig {
            name: None,
            address: addr.to_string(),
        };
        Peer::connect(&cfg, Duration::from_secs(1), dispatch_tx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn replacing_a_handler_by_name_keeps_its_position() {
        let (peer_tx, _peer_rx) = mpsc::channel(8);
        let (mut dispatcher, _tx) = Dispatcher::new(peer_tx);

        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        dispatcher.add_handler(Box::new(CountingHandler {
            name: "sync".into(),
            count: count_a.clone(),
        }));
        dispatcher.add_handler(Box::new(CountingHandler {
            name: "sync".into(),
            count: count_b.clone(),
        }));

        assert_eq!(dispatcher.handlers.len(), 1);
        assert_eq!(dispatcher.handlers[0].name(), "sync");
    }

    #[tokio::test]
    async fn a_peer_error_is_forwarded_to_the_supervisor_channel() {
        let (peer_tx, mut peer_rx) = mpsc::channel(8);
        let (dispatcher, dispatch_tx) = Dispatcher::new(peer_tx);
        let run = tokio::spawn(dispatcher.run());

        let peer = loopback_peer(dispatch_tx.clone()).await;
        peer.close().await;

        let event = peer_rx.recv().await.expect("supervisor should see an event");
        assert!(matches!(event, PeerEvent::ErrPeer { .. }));

        drop(dispatch_tx);
        let _ = run.await;
    }
}
