use ledger_core::{Block, Transaction};
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub enum ChainEvent {
    /// Genesis is in place and the tip is known.
    InitComplete,
    /// A block joined the active chain, with its full transactions.
    BlockConfirmed { block: Block, txs: Vec<Transaction> },
}

#[derive(Clone, Debug)]
pub enum PeerEvent {
    /// The first connection finished its handshake.
    NetConnected { connection: u64 },
}

/// Everything collaborators report back to the node.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    Chain(ChainEvent),
    Peer(PeerEvent),
}

impl From<ChainEvent> for NodeEvent {
    fn from(event: ChainEvent) -> Self {
        Self::Chain(event)
    }
}

impl From<PeerEvent> for NodeEvent {
    fn from(event: PeerEvent) -> Self {
        Self::Peer(event)
    }
}

pub type EventSender = mpsc::UnboundedSender<NodeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<NodeEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
