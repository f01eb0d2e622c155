use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::dht_messages::NodeId;

/// Largest identifier width that still fits a `NodeId`.
pub const MAX_BITS: u32 = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdSpaceError {
    #[error("finger table size must be within 1..={MAX_BITS}, got {0}")]
    InvalidBits(u32),
}

/// The m-bit circular identifier space every node of a ring agrees on.
///
/// Identifiers are the leading 64 bits of a SHA-1 digest reduced mod 2^m, so the same input
/// maps to the same id on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSpace {
    bits: u32,
}

impl IdSpace {
    pub fn new(bits: u32) -> Result<Self, IdSpaceError> {
        if bits == 0 || bits > MAX_BITS {
            return Err(IdSpaceError::InvalidBits(bits));
        }
        Ok(Self { bits })
    }

    /// m, which is also the number of finger table entries.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// 2^m, the number of distinct ids.
    pub fn size(&self) -> u128 {
        1u128 << self.bits
    }

    pub fn reduce(&self, value: u64) -> NodeId {
        if self.bits == MAX_BITS {
            value
        } else {
            value & ((1u64 << self.bits) - 1)
        }
    }

    /// Id of the node listening on `address:port`.
    pub fn hash_address(&self, address: &str, port: u16) -> NodeId {
        self.hash_key(format!("{}:{}", address, port).as_bytes())
    }

    /// Id under which an arbitrary key is stored.
    pub fn hash_key(&self, key: &[u8]) -> NodeId {
        let mut hasher = Sha1::new();
        hasher.update(key);
        let digest = hasher.finalize();
        let prefix = digest
            .iter()
            .take(8)
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        self.reduce(prefix)
    }

    /// Start of finger `index` (1-indexed): `id + 2^(index-1) mod 2^m`.
    pub fn finger_start(&self, id: NodeId, index: u32) -> NodeId {
        let offset = 1u128 << index.saturating_sub(1).min(self.bits - 1);
        ((u128::from(id) + offset) % self.size()) as NodeId
    }

    /// Clockwise distance from `from` to `to`.
    pub fn distance(&self, from: NodeId, to: NodeId) -> u128 {
        let size = self.size();
        (u128::from(to) + size - u128::from(from)) % size
    }
}
