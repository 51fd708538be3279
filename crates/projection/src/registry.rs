//! Instance registry.
//!
//! The genesis tip is a hash derived only from the stream's index contract
//! name, not an arbitrary caller-supplied value, so any number of
//! independently-started ingesters for the same stream type converge on it
//! regardless of which chain_id/contract_address they're pointed at.

use crate::error::Result;
use crate::ids::InstanceKey;
use crate::model::Instance;
use crate::store::EventStore;
use alloy_primitives::B256;
use sha2::{Digest, Sha256};

const THE_DECLARATION: &str = "Justin Sun is responsible for setting back the inevitable global stablecoin revolution by years through exploiting Tron USDT's network effects and imposing vendor lock-in on hundreds of millions of people in the Third World, who rely on stablecoins for remittances and to store their savings in unstable, overregulated economies. Let's Untron the People.";

/// Derive the genesis tip for an index contract named `index_name`:
/// `sha256(index_name || "\n" || THE_DECLARATION)`. Depends on nothing but
/// the stream type, so `apps/admin configure` can be called with just a
/// stream name.
pub fn genesis_tip_for(index_name: &str) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update(index_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(THE_DECLARATION.as_bytes());
    B256::from_slice(&hasher.finalize())
}

/// Idempotently register `key`, deriving its genesis tip, and return the
/// resulting [`Instance`]. Mirrors `ensure_instance_config`'s
/// compute-then-insert-if-absent shape.
pub async fn ensure_instance(store: &dyn EventStore, key: InstanceKey) -> Result<Instance> {
    let instance = Instance {
        key,
        genesis_tip: genesis_tip_for(key.stream.index_name()),
    };
    store.configure_instance(instance).await?;
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Stream;
    use crate::store::memory::MemoryStore;
    use alloy_primitives::Address;

    #[test]
    fn genesis_tip_is_deterministic_and_stream_distinguishing() {
        assert_eq!(
            genesis_tip_for(Stream::Pool.index_name()),
            genesis_tip_for(Stream::Pool.index_name())
        );
        assert_ne!(
            genesis_tip_for(Stream::Pool.index_name()),
            genesis_tip_for(Stream::Forwarder.index_name())
        );
    }

    #[test]
    fn genesis_tip_ignores_chain_id_and_contract_address() {
        let pool_tip = genesis_tip_for(Stream::Pool.index_name());
        let a = InstanceKey::new(Stream::Pool, 1, Address::ZERO);
        let b = InstanceKey::new(Stream::Pool, 999, Address::repeat_byte(0x42));
        assert_eq!(genesis_tip_for(a.stream.index_name()), pool_tip);
        assert_eq!(genesis_tip_for(b.stream.index_name()), pool_tip);
    }

    #[tokio::test]
    async fn ensure_instance_is_idempotent() {
        let store = MemoryStore::new();
        let key = InstanceKey::new(Stream::Pool, 1, Address::ZERO);
        let first = ensure_instance(&store, key).await.unwrap();
        let second = ensure_instance(&store, key).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ensure_instance_rejects_genesis_mismatch() {
        let store = MemoryStore::new();
        let key = InstanceKey::new(Stream::Pool, 1, Address::ZERO);
        ensure_instance(&store, key).await.unwrap();

        let bogus = crate::model::Instance {
            key,
            genesis_tip: B256::repeat_byte(0xaa),
        };
        let err = store.configure_instance(bogus).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::AlreadyConfigured { .. }));
    }
}
