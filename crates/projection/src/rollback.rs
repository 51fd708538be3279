//! Rollback engine.
//!
//! Undoes the projected effects of every event at `event_seq >=
//! rollback_seq`, then rewinds the cursor so a subsequent
//! [`crate::catchup::apply_catchup`] in the same transaction replays
//! whatever is canonical after the reorg. Canonicality is flipped first,
//! then the tip is recomputed from the post-flip canonical set, so it
//! never observes a stale row.

use crate::error::{Error, Result};
use crate::ids::InstanceKey;
use crate::model::StreamCursor;
use crate::store::ProjectionTx;

/// Roll `instance` back to just before `rollback_seq`: every versioned
/// family and ledger is undone to its state as of `rollback_seq - 1`, and
/// the cursor is rewound to `(rollback_seq - 1, tip)` where `tip` is read
/// from the now-canonical event at `rollback_seq - 1` (or the instance's
/// `genesis_tip` if `rollback_seq == 1`).
pub async fn rollback_from(
    tx: &mut dyn ProjectionTx,
    instance: InstanceKey,
    rollback_seq: u64,
) -> Result<()> {
    if rollback_seq == 0 {
        // Nothing applied can precede seq 0; rolling back to "before seq 0"
        // is a no-op by construction.
        return Ok(());
    }

    tx.ledger_rollback(instance, rollback_seq).await?;
    tx.versioned_rollback(instance, rollback_seq).await?;

    let tip = if rollback_seq == 1 {
        let instance_row = tx
            .get_instance(instance)
            .await?
            .ok_or(Error::NotConfigured(instance))?;
        instance_row.genesis_tip
    } else {
        let prior_seq = rollback_seq - 1;
        let prior_event = tx
            .get_canonical_event(instance, prior_seq)
            .await?
            .ok_or(Error::MissingCurrent {
                instance,
                family: "event_appended",
                key: prior_seq.to_string(),
                event_seq: prior_seq,
            })?;
        prior_event.new_tip
    };

    tx.save_cursor(
        instance,
        StreamCursor {
            applied_through_seq: rollback_seq - 1,
            tip,
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Stream;
    use crate::interpreter::Interpreter;
    use crate::model::{Args, EventAppended, Instance, NewEvent};
    use crate::registry::genesis_tip_for;
    use crate::store::{EventStore, SeqRange, memory::MemoryStore};
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
    async fn rollback_rewinds_cursor_to_prior_canonical_tip() {
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
        let events = chain_events(instance, genesis, 3);
        let second_new_tip = events[1].new_tip;
        store.append_events(events).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        crate::catchup::apply_catchup(&mut *tx, &NoopInterpreter, instance, 3)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        store
            .set_canonical(instance, SeqRange::from(3), false)
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        rollback_from(&mut *tx, instance, 3).await.unwrap();
        let cursor = tx.load_cursor_for_update(instance).await.unwrap().unwrap();
        tx.commit().await.unwrap();

        assert_eq!(cursor.applied_through_seq, 2);
        assert_eq!(cursor.tip, second_new_tip);
    }

    #[tokio::test]
    async fn rollback_to_seq_one_uses_genesis_tip() {
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
            .append_events(chain_events(instance, genesis, 1))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        crate::catchup::apply_catchup(&mut *tx, &NoopInterpreter, instance, 1)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        store
            .set_canonical(instance, SeqRange::from(1), false)
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        rollback_from(&mut *tx, instance, 1).await.unwrap();
        let cursor = tx.load_cursor_for_update(instance).await.unwrap().unwrap();
        tx.commit().await.unwrap();

        assert_eq!(cursor.applied_through_seq, 0);
        assert_eq!(cursor.tip, genesis);
    }
}
