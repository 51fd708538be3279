//! Catch-up engine.
//!
//! Advances one instance's cursor forward over however much canonical
//! history has accumulated since it was last applied, verifying the
//! hash-chain at every step. Runs entirely inside the transaction its
//! caller ([`crate::dispatch::Dispatcher`]) opened.

use crate::error::{Error, Result};
use crate::ids::InstanceKey;
use crate::interpreter::Interpreter;
use crate::model::StreamCursor;
use crate::store::ProjectionTx;

/// Apply every canonical event strictly after `tx`'s loaded cursor, up to and
/// including `target_seq`, for `instance`. Returns the number of events
/// applied. Aborts (leaving `tx` uncommitted) on the first
/// [`Error::TipMismatch`] or any interpreter error — the caller must not
/// commit a transaction that hit one.
pub async fn apply_catchup(
    tx: &mut dyn ProjectionTx,
    interpreter: &dyn Interpreter,
    instance: InstanceKey,
    target_seq: u64,
) -> Result<u64> {
    let Some(cursor) = tx.load_cursor_for_update(instance).await? else {
        return Err(Error::NotConfigured(instance));
    };

    let mut applied = 0u64;
    let mut cursor = cursor;

    while cursor.applied_through_seq < target_seq {
        let next_seq = cursor.applied_through_seq + 1;
        let Some(event) = tx.get_canonical_event(instance, next_seq).await? else {
            // Nothing canonical at this seq yet (e.g. a gap left by an
            // in-flight reorg). Stop; the dispatcher will re-drive catch-up
            // once the gap is filled.
            break;
        };

        if event.prev_tip != cursor.tip {
            return Err(Error::TipMismatch {
                instance,
                event_seq: event.event_seq,
                expected: cursor.tip,
                got: event.prev_tip,
            });
        }

        interpreter.apply_one(tx, instance, &event).await?;

        cursor = StreamCursor {
            applied_through_seq: event.event_seq,
            tip: event.new_tip,
        };
        applied += 1;
    }

    tx.save_cursor(instance, cursor).await?;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Stream;
    use crate::model::{Args, EventAppended, Instance, NewEvent};
    use crate::registry::genesis_tip_for;
    use crate::store::{EventStore, memory::MemoryStore};
    use alloy_primitives::{Address, B256, keccak256};

    struct NoopInterpreter;

    #[async_trait::async_trait]
    impl Interpreter for NoopInterpreter {
        async fn apply_one(
            &self,
            _tx: &mut dyn ProjectionTx,
            _instance: InstanceKey,
            _event: &EventAppended,
        ) -> Result<()> {
            Ok(())
        }
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
                event_type: "Noop".to_string(),
                args: Args::new(),
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
    async fn applies_events_in_order_and_advances_cursor() {
        let store = MemoryStore::new();
        let instance = InstanceKey::new(Stream::Pool, 1, Address::ZERO);
        let genesis = genesis_tip_for(instance.stream.index_name());
        store
            .configure_instance(Instance {
                key: instance,
                genesis_tip: genesis,
            })
            .await
            .unwrap();
        store
            .append_events(chain_events(instance, genesis, 3))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let applied = apply_catchup(&mut *tx, &NoopInterpreter, instance, 3)
            .await
            .unwrap();
        assert_eq!(applied, 3);
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let cursor = tx.load_cursor_for_update(instance).await.unwrap().unwrap();
        assert_eq!(cursor.applied_through_seq, 3);
    }

    #[tokio::test]
    async fn tip_mismatch_aborts_without_advancing_cursor() {
        let store = MemoryStore::new();
        let instance = InstanceKey::new(Stream::Pool, 1, Address::ZERO);
        let genesis = genesis_tip_for(instance.stream.index_name());
        store
            .configure_instance(Instance {
                key: instance,
                genesis_tip: genesis,
            })
            .await
            .unwrap();
        let mut events = chain_events(instance, genesis, 2);
        events[1].prev_tip = B256::repeat_byte(0x42);
        store.append_events(events).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = apply_catchup(&mut *tx, &NoopInterpreter, instance, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TipMismatch { .. }));
    }
}
