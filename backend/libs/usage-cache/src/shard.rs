//! Deterministic client → shard placement

use crate::error::{CacheError, CacheResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Persisted placement of one client. Treated as immutable once stored, even
/// if the shard count changes later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub client_id: String,
    pub shard_id: u32,
    pub created_at: DateTime<Utc>,
}

/// Maps client identifiers onto `shard_count` shards.
///
/// SHA-256 over the full identifier keeps placement stable across builds and
/// toolchains (`DefaultHasher` gives no such guarantee) and spreads
/// near-identical ids evenly.
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    pub fn new(shard_count: u32) -> CacheResult<Self> {
        if shard_count == 0 {
            return Err(CacheError::Configuration(
                "shard_count must be greater than zero".to_string(),
            ));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn shard_for(&self, client_id: &str) -> u32 {
        shard_for(client_id, self.shard_count)
    }

    /// Keep an existing assignment, otherwise compute a fresh one.
    pub fn assign(&self, client_id: &str, persisted: Option<ShardAssignment>) -> ShardAssignment {
        match persisted {
            Some(existing) => existing,
            None => ShardAssignment {
                client_id: client_id.to_string(),
                shard_id: self.shard_for(client_id),
                created_at: Utc::now(),
            },
        }
    }
}

/// Pure placement function. `shard_count` must be non-zero; use
/// [`ShardRouter`] to have that checked once up front.
pub fn shard_for(client_id: &str, shard_count: u32) -> u32 {
    let digest = Sha256::digest(client_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(shard_count.max(1))) as u32
}
