use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ledger_core::chain::ChainStore;
use ledger_core::{AcceptAll, PeerAddress, Validator};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_REBROADCAST_SECS;

/// Settings consumed once when the node is constructed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub home_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Peer listener. `None` means outbound connections only.
    pub listen: Option<SocketAddr>,
    /// Status façade. `None` keeps it off.
    pub rpc_listen: Option<SocketAddr>,
    /// Seeds dialled when networking comes up.
    pub peers: Vec<PeerAddress>,
    /// Check merkle roots and proof of work of incoming blocks.
    pub verify: bool,
    pub verify_scripts: bool,
    /// Height of the last hard-coded checkpoint. Transactions are ignored below it.
    pub checkpoint_height: u64,
    pub rebroadcast_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from("./ledger"),
            data_dir: PathBuf::from("./ledger/data"),
            listen: None,
            rpc_listen: None,
            peers: Vec::new(),
            verify: true,
            verify_scripts: true,
            checkpoint_height: 0,
            rebroadcast_secs: DEFAULT_REBROADCAST_SECS,
        }
    }
}

/// What the node is built from: settings, a storage handle and the
/// consensus checks it delegates to.
#[derive(Clone)]
pub struct NodeContext {
    pub config: NodeConfig,
    pub store: Arc<dyn ChainStore>,
    pub validator: Arc<dyn Validator>,
}

impl NodeContext {
    pub fn new(config: NodeConfig, store: Arc<dyn ChainStore>) -> Self {
        Self {
            config,
            store,
            validator: Arc::new(AcceptAll),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }
}
