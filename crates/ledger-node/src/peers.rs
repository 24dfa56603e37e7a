use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ledger_core::{format_hash, Hash, Message, PeerAddress};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use crate::events::{EventSender, NodeEvent, PeerEvent};

/// One peer connection as the protocol layer sees it: an address, an
/// outbox, and the per-connection continuation marker.
pub struct Connection {
    id: u64,
    addr: PeerAddress,
    outbox: mpsc::UnboundedSender<Message>,
    continuation: Mutex<Option<Hash>>,
    handshaked: AtomicBool,
}

impl Connection {
    pub fn new(id: u64, addr: PeerAddress) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id,
            addr,
            outbox,
            continuation: Mutex::new(None),
            handshaked: AtomicBool::new(false),
        });
        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &PeerAddress {
        &self.addr
    }

    /// Queue a message. Returns `false` when the connection is gone.
    pub fn send(&self, message: Message) -> bool {
        let command = message.command();
        match self.outbox.send(message) {
            Ok(()) => true,
            Err(_) => {
                debug!(peer = %self.addr, command, "connection closed, message dropped");
                false
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.outbox.is_closed()
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::SeqCst)
    }

    /// Last hash of a truncated `getblocks` reply, if one is outstanding.
    pub async fn continuation(&self) -> Option<Hash> {
        *self.continuation.lock().await
    }

    pub async fn set_continuation(&self, hash: Option<Hash>) {
        if let Some(hash) = &hash {
            debug!(peer = %self.addr, hash = %format_hash(hash), "continuation marker set");
        }
        *self.continuation.lock().await = hash;
    }
}

/// Registry of live connections and seed addresses.
pub struct PeerManager {
    enabled: AtomicBool,
    next_id: AtomicU64,
    best_height: AtomicU64,
    net_connected: AtomicBool,
    seeds: RwLock<Vec<PeerAddress>>,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    events: EventSender,
}

impl PeerManager {
    pub fn new(events: EventSender) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            best_height: AtomicU64::new(0),
            net_connected: AtomicBool::new(false),
            seeds: RwLock::new(Vec::new()),
            connections: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("peer management enabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn add_peer(&self, addr: PeerAddress) {
        let mut seeds = self.seeds.write().await;
        if !seeds.contains(&addr) {
            seeds.push(addr);
        }
    }

    pub async fn seeds(&self) -> Vec<PeerAddress> {
        self.seeds.read().await.clone()
    }

    /// Create a connection record. The receiver yields what must be written to the peer.
    pub async fn register(&self, addr: PeerAddress) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (conn, rx) = Connection::new(id, addr);
        self.connections.write().await.insert(id, Arc::clone(&conn));
        debug!(peer = %addr, id, "connection registered");
        (conn, rx)
    }

    pub async fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: u64) {
        if let Some(conn) = self.connections.write().await.remove(&id) {
            debug!(peer = %conn.addr(), id, "connection removed");
        }
    }

    /// Mark the handshake done. The first one network-wide raises `NetConnected`.
    pub fn mark_handshaked(&self, conn: &Connection) {
        if conn.handshaked.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(peer = %conn.addr(), "handshake complete");
        if !self.net_connected.swap(true, Ordering::SeqCst) {
            let event = NodeEvent::Peer(PeerEvent::NetConnected { connection: conn.id() });
            if self.events.send(event).is_err() {
                debug!("node event channel closed");
            }
        }
    }

    /// Highest tip any peer has announced.
    pub fn best_height(&self) -> u64 {
        self.best_height.load(Ordering::SeqCst)
    }

    pub fn record_height(&self, height: u64) {
        self.best_height.fetch_max(height, Ordering::SeqCst);
    }

    /// Handshaked connections that are still open.
    pub async fn active_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|conn| conn.is_handshaked() && conn.is_open())
            .cloned()
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send to every active connection. Returns how many accepted the message.
    /// Nothing goes out before peer management is enabled.
    pub async fn broadcast(&self, message: Message) -> usize {
        if !self.is_enabled() {
            debug!(command = message.command(), "peer management disabled, broadcast dropped");
            return 0;
        }
        let mut sent = 0;
        for conn in self.active_connections().await {
            if conn.send(message.clone()) {
                sent += 1;
            }
        }
        sent
    }
}
