//! The node state machine and the wiring between its collaborators.
//!
//! ```text
//! Uninitialized -> Init -> NetConnect -> BlockDownload -> Default
//!        \___________\________\______________\______________> Failed
//! ```
//!
//! Protocol traffic is handled only in `NetConnect`, `BlockDownload` and
//! `Default`. Collaborators report through one [`NodeEvent`] channel, and
//! the router spawned by [`Node::start`] forwards each event to a fixed
//! set of receivers.

use std::sync::Arc;
use std::time::Duration;

use ledger_core::chain::ChainStore;
use ledger_core::{Message, PeerAddress, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::{Chain, ChainError};
use crate::config::{NodeConfig, NodeContext};
use crate::constants::{NODE_NETWORK, PROTOCOL_VERSION};
use crate::download::DownloadManager;
use crate::events::{self, ChainEvent, EventReceiver, NodeEvent, PeerEvent};
use crate::mempool::{MempoolGateway, TxStore};
use crate::peers::{Connection, PeerManager};
use crate::protocol::InventoryHandler;
use crate::sender::TxSender;
use crate::{rpc, transport};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Uninitialized,
    Init,
    NetConnect,
    BlockDownload,
    Default,
    Failed,
}

impl NodeState {
    /// Whether protocol traffic is handled in this state.
    pub fn is_running(self) -> bool {
        matches!(self, Self::NetConnect | Self::BlockDownload | Self::Default)
    }

    fn can_enter(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Uninitialized, Init)
                | (Init, NetConnect)
                | (NetConnect, BlockDownload)
                | (BlockDownload, Default)
                | (Uninitialized | Init | NetConnect | BlockDownload | Default, Failed)
        )
    }
}

pub struct Node {
    config: NodeConfig,
    store: Arc<dyn ChainStore>,
    chain: Arc<Chain>,
    mempool: Arc<TxStore>,
    peers: Arc<PeerManager>,
    sender: Arc<TxSender>,
    download: Arc<DownloadManager>,
    handler: InventoryHandler,
    state: watch::Sender<NodeState>,
    events: Mutex<Option<EventReceiver>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build the node and its collaborators. Directory or storage failures
    /// are `NodeError::Setup`; the node is then never constructed.
    pub async fn new(ctx: NodeContext) -> Result<Arc<Self>, NodeError> {
        let NodeContext { config, store, validator } = ctx;
        for dir in [&config.home_dir, &config.data_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| NodeError::Setup(format!("cannot create {}: {e}", dir.display())))?;
        }
        store
            .connect()
            .await
            .map_err(|e| NodeError::Setup(format!("cannot open storage: {e}")))?;

        let (event_tx, event_rx) = events::channel();
        let chain = Arc::new(Chain::new(
            Arc::clone(&store),
            Arc::clone(&validator),
            config.verify,
            config.checkpoint_height,
            event_tx.clone(),
        ));
        let mempool = Arc::new(TxStore::new(Arc::clone(&store), validator, config.verify_scripts));
        let peers = Arc::new(PeerManager::new(event_tx));
        let sender = Arc::new(TxSender::new(
            Arc::clone(&peers),
            Arc::clone(&mempool) as Arc<dyn MempoolGateway>,
            Duration::from_secs(config.rebroadcast_secs.max(1)),
        ));
        let download = Arc::new(DownloadManager::new(Arc::clone(&store)));
        let handler = InventoryHandler::new(
            Arc::clone(&store),
            Arc::clone(&chain),
            Arc::clone(&mempool) as Arc<dyn MempoolGateway>,
            Arc::clone(&peers),
            Arc::clone(&sender),
            Arc::clone(&download),
        );
        let (state, _) = watch::channel(NodeState::Uninitialized);

        Ok(Arc::new(Self {
            config,
            store,
            chain,
            mempool,
            peers,
            sender,
            download,
            handler,
            state,
            events: Mutex::new(Some(event_rx)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Observe state changes, starting with the current state.
    pub fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn mempool(&self) -> &Arc<TxStore> {
        &self.mempool
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn sender(&self) -> &Arc<TxSender> {
        &self.sender
    }

    pub fn handler(&self) -> &InventoryHandler {
        &self.handler
    }

    pub async fn add_peer(&self, addr: PeerAddress) {
        self.peers.add_peer(addr).await;
    }

    /// Enter `Init`: start the event router and initialize the chain.
    /// Calling it again after the first time does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        if !self.set_state(NodeState::Init).await {
            debug!("start ignored, node already started");
            return Ok(());
        }
        if let Some(events) = self.events.lock().await.take() {
            let node = Arc::clone(self);
            self.track(tokio::spawn(node.route_events(events))).await;
        }
        for seed in &self.config.peers {
            self.peers.add_peer(*seed).await;
        }

        if let Err(err) = self.chain.init().await {
            error!(error = %err, "chain initialization failed");
            self.set_state(NodeState::Failed).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Move to `next` if the transition is allowed. Returns whether it happened.
    pub async fn set_state(self: &Arc<Self>, next: NodeState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_enter(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if !changed {
            debug!(current = ?self.state(), requested = ?next, "state transition rejected");
            return false;
        }
        info!(state = ?next, "node state changed");
        if next == NodeState::NetConnect {
            self.enable_network().await;
        }
        true
    }

    async fn enable_network(self: &Arc<Self>) {
        self.peers.enable();
        self.download.enable();
        self.track(self.sender.enable()).await;

        if let Some(addr) = self.config.rpc_listen {
            let node = Arc::clone(self);
            self.track(tokio::spawn(async move {
                if let Err(err) = rpc::serve(node, addr).await {
                    error!(error = %err, "status server stopped");
                }
            }))
            .await;
        }
        if let Some(addr) = self.config.listen {
            let node = Arc::clone(self);
            self.track(tokio::spawn(async move {
                if let Err(err) = transport::listen(node, addr).await {
                    error!(error = %err, "peer listener stopped");
                }
            }))
            .await;
        }
        for seed in self.peers.seeds().await {
            let node = Arc::clone(self);
            self.track(tokio::spawn(async move {
                if let Err(err) = transport::dial(node, seed).await {
                    warn!(peer = %seed, error = %err, "could not connect to seed");
                }
            }))
            .await;
        }
    }

    async fn route_events(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::Chain(ChainEvent::InitComplete) => {
                    self.set_state(NodeState::NetConnect).await;
                }
                NodeEvent::Chain(ChainEvent::BlockConfirmed { block, txs }) => {
                    self.mempool.handle_block_confirmed(&block, &txs).await;
                    self.sender.handle_block(&txs).await;
                    self.check_synced().await;
                }
                NodeEvent::Peer(PeerEvent::NetConnected { connection }) => {
                    if !self.set_state(NodeState::BlockDownload).await {
                        continue;
                    }
                    if let Some(conn) = self.peers.get(connection).await {
                        if let Err(err) = self.download.request_blocks(&conn, [0u8; 32]).await {
                            warn!(error = %err, "initial block request failed");
                        }
                    }
                    self.check_synced().await;
                }
            }
        }
        debug!("event router stopped");
    }

    /// Leave `BlockDownload` once our tip has caught up with the best peer.
    async fn check_synced(self: &Arc<Self>) {
        if self.state() == NodeState::BlockDownload && self.chain.top_height() >= self.peers.best_height() {
            self.set_state(NodeState::Default).await;
        }
    }

    /// Start the per-connection loop: announce ourselves, then handle the
    /// peer's messages one at a time, in arrival order. Connections arriving
    /// before `NetConnect` are dropped.
    pub async fn accept(
        self: &Arc<Self>,
        conn: Arc<Connection>,
        mut messages: mpsc::UnboundedReceiver<Message>,
        inbound: bool,
    ) {
        if !self.peers.is_enabled() {
            debug!(peer = %conn.addr(), inbound, "peer management disabled, connection dropped");
            self.peers.remove(conn.id()).await;
            return;
        }
        info!(peer = %conn.addr(), inbound, "peer connected");
        conn.send(Message::Version {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            height: self.chain.top_height(),
        });
        let node = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                node.handle_message(&conn, message).await;
            }
            node.peers.remove(conn.id()).await;
            info!(peer = %conn.addr(), "peer disconnected");
        });
        self.track(handle).await;
    }

    /// Dispatch one message. Returns `false` if it was dropped because the
    /// node is not running.
    pub async fn handle_message(&self, conn: &Connection, message: Message) -> bool {
        let command = message.command();
        if !self.is_running() {
            debug!(peer = %conn.addr(), command, state = ?self.state(), "node not running, message dropped");
            return false;
        }

        let result = match message {
            Message::Version { version, height, .. } => {
                debug!(peer = %conn.addr(), version, height, "peer version");
                self.peers.record_height(height);
                conn.send(Message::Verack);
                Ok(())
            }
            Message::Verack => {
                self.peers.mark_handshaked(conn);
                Ok(())
            }
            Message::Inv(items) => self.handler.handle_inv(&items, conn).await,
            Message::GetData(items) => self.handler.handle_getdata(&items, conn).await,
            Message::GetBlocks { locator, stop } => self.handler.handle_getblocks(&locator, &stop, conn).await,
            Message::GetHeaders { locator, stop } => self.handler.handle_getheaders(&locator, &stop, conn).await,
            Message::Block(block) => self.handler.handle_block(block, conn).await,
            Message::Tx(tx) => {
                self.handler.handle_tx(tx, conn).await;
                Ok(())
            }
            Message::Headers(headers) => {
                debug!(peer = %conn.addr(), count = headers.len(), "headers ignored, blocks are fetched whole");
                Ok(())
            }
        };
        match result {
            Err(err) if err.is_transient() => {
                warn!(peer = %conn.addr(), command, error = %err, "storage unavailable, message not handled");
            }
            Err(err) => error!(peer = %conn.addr(), command, error = %err, "message handling failed"),
            Ok(()) => {}
        }
        true
    }

    async fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    /// Stop background tasks and flush storage.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        info!(tasks = tasks.len(), "shutting down");
        for task in tasks {
            task.abort();
        }
        self.store.flush().await?;
        Ok(())
    }
}
