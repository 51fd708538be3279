//! Dispatch layer.
//!
//! There's no database trigger driving this; the caller (an ingester's
//! runner loop) calls [`Dispatcher::on_events_inserted`]/
//! [`Dispatcher::on_canonical_flip`] explicitly right after the
//! corresponding [`EventStore`] call. Per-instance seriality is an
//! in-process `tokio::sync::Mutex` keyed by [`InstanceKey::advisory_hash`],
//! not a literal Postgres advisory lock — this crate never runs two
//! catch-ups for the same instance concurrently, but does not coordinate
//! across separate processes.

use crate::error::Result;
use crate::ids::{InstanceKey, Stream};
use crate::interpreter::Interpreter;
use crate::store::EventStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Drives [`crate::catchup::apply_catchup`]/[`crate::rollback::rollback_from`]
/// in response to [`EventStore`] mutations, serializing per instance.
pub struct Dispatcher<S> {
    store: Arc<S>,
    pool_interpreter: Arc<dyn Interpreter>,
    forwarder_interpreter: Arc<dyn Interpreter>,
    locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl<S: EventStore + 'static> Dispatcher<S> {
    /// Construct a dispatcher over `store`, applying pool events with
    /// `pool_interpreter` and forwarder events with `forwarder_interpreter`.
    pub fn new(
        store: Arc<S>,
        pool_interpreter: Arc<dyn Interpreter>,
        forwarder_interpreter: Arc<dyn Interpreter>,
    ) -> Self {
        Self {
            store,
            pool_interpreter,
            forwarder_interpreter,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn interpreter_for(&self, stream: Stream) -> &dyn Interpreter {
        match stream {
            Stream::Pool => self.pool_interpreter.as_ref(),
            Stream::Forwarder => self.forwarder_interpreter.as_ref(),
        }
    }

    async fn lock_for(&self, instance: InstanceKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(instance.advisory_hash())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Call after `EventStore::append_events`, passing the instances it
    /// returned. Runs one transaction-scoped catch-up per instance.
    pub async fn on_events_inserted(&self, touched: Vec<InstanceKey>) -> Result<()> {
        for instance in touched {
            self.catch_up(instance).await?;
        }
        Ok(())
    }

    /// Call after `EventStore::set_canonical(instance, range, canonical)`,
    /// passing the `event_seq`s it reports as actually changed. When rows
    /// flipped canonical `true -> false`, rolls back to the lowest affected
    /// seq first; always re-runs catch-up afterward if anything changed —
    /// rollback-then-catch-up is the only allowed composition.
    pub async fn on_canonical_flip(
        &self,
        instance: InstanceKey,
        canonical: bool,
        changed_seqs: Vec<u64>,
    ) -> Result<()> {
        if changed_seqs.is_empty() {
            return Ok(());
        }

        let lock = self.lock_for(instance).await;
        let _guard = lock.lock().await;

        if !canonical {
            let rollback_seq = changed_seqs.iter().copied().min().expect("non-empty");
            let mut tx = self.store.begin().await?;
            crate::rollback::rollback_from(&mut *tx, instance, rollback_seq).await?;
            crate::catchup::apply_catchup(
                &mut *tx,
                self.interpreter_for(instance.stream),
                instance,
                u64::MAX,
            )
            .await?;
            tx.commit().await?;
        } else {
            self.catch_up_locked(instance).await?;
        }

        Ok(())
    }

    async fn catch_up(&self, instance: InstanceKey) -> Result<()> {
        let lock = self.lock_for(instance).await;
        let _guard = lock.lock().await;
        self.catch_up_locked(instance).await
    }

    async fn catch_up_locked(&self, instance: InstanceKey) -> Result<()> {
        let mut tx = self.store.begin().await?;
        crate::catchup::apply_catchup(
            &mut *tx,
            self.interpreter_for(instance.stream),
            instance,
            u64::MAX,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::ForwarderInterpreter;
    use crate::interpreter::args;
    use crate::model::{ArgValue, Instance, NewEvent};
    use crate::pool::PoolInterpreter;
    use crate::registry::genesis_tip_for;
    use crate::store::{EventStore, SeqRange, memory::MemoryStore};
    use alloy_primitives::{Address, B256, keccak256};

    fn dispatcher(store: Arc<MemoryStore>) -> Dispatcher<MemoryStore> {
        Dispatcher::new(
            store,
            Arc::new(PoolInterpreter),
            Arc::new(ForwarderInterpreter),
        )
    }

    fn chain_events(instance: InstanceKey, genesis: B256, n: u64) -> Vec<NewEvent> {
        let mut tip = genesis;
        let mut out = Vec::new();
        for seq in 1..=n {
            let new_tip = keccak256([tip.as_slice(), &seq.to_be_bytes()].concat());
            out.push(NewEvent {
                instance,
                event_seq: seq,
                prev_tip: tip,
                new_tip,
                event_signature: B256::ZERO,
                abi_encoded_event_data: Vec::new(),
                event_type: "OwnershipTransferred".to_string(),
                args: args([
                    ("old_owner", ArgValue::Text(crate::interpreter::hex_address(Address::ZERO))),
                    ("new_owner", ArgValue::Text(crate::interpreter::hex_address(Address::repeat_byte(seq as u8)))),
                ]),
                block_number: seq,
                block_timestamp: seq,
                block_hash: B256::ZERO,
                tx_hash: B256::ZERO,
                log_index: 0,
            });
            tip = new_tip;
        }
        out
    }

    #[tokio::test]
    async fn insert_then_flip_drives_catchup_and_rollback() {
        let store = Arc::new(MemoryStore::new());
        let instance = InstanceKey::new(crate::ids::Stream::Pool, 1, Address::ZERO);
        let genesis = genesis_tip_for(instance.stream.index_name());
        store
            .configure_instance(Instance {
                key: instance,
                genesis_tip: genesis,
            })
            .await
            .unwrap();

        let dispatcher = dispatcher(store.clone());

        let touched = store
            .append_events(chain_events(instance, genesis, 3))
            .await
            .unwrap();
        dispatcher.on_events_inserted(touched).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let cursor = tx.load_cursor_for_update(instance).await.unwrap().unwrap();
        assert_eq!(cursor.applied_through_seq, 3);
        tx.commit().await.unwrap();

        let changed = store
            .set_canonical(instance, SeqRange::from(2), false)
            .await
            .unwrap();
        dispatcher
            .on_canonical_flip(instance, false, changed)
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let cursor = tx.load_cursor_for_update(instance).await.unwrap().unwrap();
        assert_eq!(cursor.applied_through_seq, 1);
        tx.commit().await.unwrap();
    }
}
