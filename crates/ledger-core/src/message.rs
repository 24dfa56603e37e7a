use serde::{Deserialize, Serialize};

use crate::{BlockHeader, Hash, Transaction};

/// Inventory object kinds, with their wire codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvKind {
    Transaction,
    Block,
    /// A code this node doesn't understand. Ignored by the handlers.
    Unknown(u32),
}

impl InvKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::Transaction => 1,
            Self::Block => 2,
            Self::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Transaction,
            2 => Self::Block,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash,
}

impl InvItem {
    pub fn tx(hash: Hash) -> Self {
        Self {
            kind: InvKind::Transaction,
            hash,
        }
    }

    pub fn block(hash: Hash) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMessage {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
    /// Serialized size as reported by the decoder.
    pub size: u32,
}

/// Decoded protocol messages handled by the synchronization core.
/// Framing and byte encoding live outside this crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Opens the handshake. `height` is the sender's active tip.
    Version {
        version: u32,
        services: u64,
        height: u64,
    },
    Verack,
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    GetBlocks { locator: Vec<Hash>, stop: Hash },
    GetHeaders { locator: Vec<Hash>, stop: Hash },
    Block(BlockMessage),
    Tx(Transaction),
    Headers(Vec<BlockHeader>),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Version { .. } => "version",
            Self::Verack => "verack",
            Self::Inv(_) => "inv",
            Self::GetData(_) => "getdata",
            Self::GetBlocks { .. } => "getblocks",
            Self::GetHeaders { .. } => "getheaders",
            Self::Block(_) => "block",
            Self::Tx(_) => "tx",
            Self::Headers(_) => "headers",
        }
    }
}
