use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::ADDRESS_HASH_SIZE;
use crate::{format_hash, sha256d, Hash};

/// Hash160 of a public key or script, as found in standard output scripts.
pub type AddressHash = [u8; ADDRESS_HASH_SIZE];

/// A specific output of a prior transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, index: u32) -> Self {
        Self { txid, index }
    }

    /// The outpoint a coinbase input refers to.
    pub fn null() -> Self {
        Self {
            txid: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.txid == [0u8; 32]
    }

    /// Fixed 36-byte key: txid followed by the big-endian index.
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.txid);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", format_hash(&self.txid), self.index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prev_out: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// The address hash of a pay-to-pubkey-hash or pay-to-script-hash script.
    pub fn address_hash(&self) -> Option<AddressHash> {
        let s = &self.script_pubkey;
        let hash = match s.len() {
            // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
            25 if s[0] == 0x76 && s[1] == 0xa9 && s[2] == 0x14 && s[23] == 0x88 && s[24] == 0xac => &s[3..23],
            // OP_HASH160 <20> OP_EQUAL
            23 if s[0] == 0xa9 && s[1] == 0x14 && s[22] == 0x87 => &s[2..22],
            _ => return None,
        };
        hash.try_into().ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    /// Address hashes this transaction touches. Derived, not part of the hash.
    #[serde(default)]
    pub affects: Option<Vec<AddressHash>>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
            affects: None,
        }
    }

    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 + self.inputs.len() * 80 + self.outputs.len() * 40);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            bytes.extend_from_slice(&input.prev_out.txid);
            bytes.extend_from_slice(&input.prev_out.index.to_le_bytes());
            bytes.extend_from_slice(&(input.script_sig.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&input.script_sig);
            bytes.extend_from_slice(&input.sequence.to_le_bytes());
        }
        bytes.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            bytes.extend_from_slice(&output.value.to_le_bytes());
            bytes.extend_from_slice(&(output.script_pubkey.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&output.script_pubkey);
        }
        bytes.extend_from_slice(&self.lock_time.to_le_bytes());
        bytes
    }

    pub fn hash(&self) -> Hash {
        sha256d(&self.hash_bytes())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_out.is_null()
    }

    /// Outpoints this transaction spends, coinbase markers excluded.
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs
            .iter()
            .map(|input| input.prev_out)
            .filter(|outpoint| !outpoint.is_null())
            .collect()
    }

    /// Fill `affects` from the standard output scripts, if it isn't set yet.
    pub fn with_derived_affects(mut self) -> Self {
        if self.affects.is_none() {
            let mut hashes: Vec<AddressHash> = Vec::new();
            for hash in self.outputs.iter().filter_map(TxOut::address_hash) {
                if !hashes.contains(&hash) {
                    hashes.push(hash);
                }
            }
            if !hashes.is_empty() {
                self.affects = Some(hashes);
            }
        }
        self
    }
}
