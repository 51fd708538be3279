//! Stream kinds and instance identity.

use alloy_primitives::Address;
use sha2::{Digest, Sha256};
use std::fmt;

/// The two contract kinds the engine projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stream {
    /// The singleton Untron Intents pool.
    Pool,
    /// A per-chain Forwarder instance.
    Forwarder,
}

impl Stream {
    /// Lowercase tag used in storage (`chain.stream` domain) and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Stream::Pool => "pool",
            Stream::Forwarder => "forwarder",
        }
    }

    /// On-chain index contract name used for `EventChainGenesis` derivation.
    pub const fn index_name(self) -> &'static str {
        match self {
            Stream::Pool => "UntronIntentsIndex",
            Stream::Forwarder => "IntentsForwarderIndex",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a single configured stream: `(stream, chain_id,
/// contract_address)`. Instances never share projection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    /// The contract kind.
    pub stream: Stream,
    /// The EVM chain id the contract is deployed on.
    pub chain_id: u64,
    /// The contract's address on that chain.
    pub contract_address: Address,
}

impl InstanceKey {
    /// Construct a new instance identity.
    pub const fn new(stream: Stream, chain_id: u64, contract_address: Address) -> Self {
        Self {
            stream,
            chain_id,
            contract_address,
        }
    }

    /// Deterministic 64-bit hash of this identity, used as the key for the
    /// per-instance advisory mutex. Stable across process
    /// restarts so a Postgres-backed deployment could also use it as a
    /// `pg_advisory_xact_lock` key, even though the in-process dispatcher
    /// (this crate) uses it only to pick a `tokio::sync::Mutex`.
    pub fn advisory_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.stream.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.chain_id.to_be_bytes());
        hasher.update(b"\0");
        hasher.update(self.contract_address.as_slice());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(chain_id={}, contract={})",
            self.stream, self.chain_id, self.contract_address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_hash_is_deterministic_and_distinguishes_instances() {
        let a = InstanceKey::new(Stream::Pool, 1, Address::ZERO);
        let b = InstanceKey::new(Stream::Pool, 1, Address::ZERO);
        let c = InstanceKey::new(Stream::Forwarder, 1, Address::ZERO);
        let d = InstanceKey::new(Stream::Pool, 2, Address::ZERO);

        assert_eq!(a.advisory_hash(), b.advisory_hash());
        assert_ne!(a.advisory_hash(), c.advisory_hash());
        assert_ne!(a.advisory_hash(), d.advisory_hash());
    }
}
