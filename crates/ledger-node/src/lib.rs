//! Synchronization core of a ledger node: the startup state machine, the
//! inventory protocol handlers and the collaborators they drive.

pub mod chain;
pub mod config;
pub mod constants;
pub mod download;
pub mod events;
pub mod mempool;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod rpc;
pub mod sender;
pub mod transport;

pub use chain::{BlockStatus, Chain, ChainError};
pub use config::{NodeConfig, NodeContext};
pub use events::{ChainEvent, NodeEvent, PeerEvent};
pub use mempool::{MempoolError, MempoolGateway, TxStore};
pub use node::{Node, NodeError, NodeState};
pub use peers::{Connection, PeerManager};
pub use protocol::InventoryHandler;
