//! Pool stream interpreter.
//!
//! Dispatch table mirrors `apps/indexer/src/decode.rs`'s `PoolEvent` enum
//! one-for-one: each match arm here corresponds to one `stream_events!`
//! variant there, with the JSON field names lifted straight from that
//! macro's declared Solidity signature.

use crate::error::{Error, Result};
use crate::ids::InstanceKey;
use crate::interpreter::{
    Interpreter, arg_address, arg_b256, arg_bool, arg_text, arg_u64, hex_address, hex_b256,
};
use crate::model::EventAppended;
use crate::store::ProjectionTx;
use crate::tron_address::{intent_hash, to_tron_base58};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

const SINGLETON_KEY: &str = "singleton";

const FAMILY_OWNERSHIP: &str = "Ownership";
const FAMILY_RECOMMENDED_FEE: &str = "RecommendedFee";
const FAMILY_RECEIVER_INTENT_PARAMS: &str = "ReceiverIntentParams";
const FAMILY_RECEIVER_INTENT_FEE_SNAP: &str = "ReceiverIntentFeeSnap";
const FAMILY_INTENT: &str = "Intent";

#[derive(Debug, Serialize, Deserialize)]
struct OwnershipRow {
    old_owner: String,
    new_owner: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecommendedFeeRow {
    fee_ppm: String,
    fee_flat: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReceiverIntentParamsRow {
    forwarder: String,
    to_tron_evm: String,
    to_tron: String,
    forward_salt: String,
    token: String,
    amount_param: String,
    intent_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReceiverIntentFeeSnapRow {
    fee_ppm: String,
    fee_flat: String,
    tron_payment_amount: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct IntentRow {
    creator: String,
    intent_type: u8,
    escrow_token: String,
    escrow_amount: String,
    refund_beneficiary: String,
    deadline: String,
    intent_specs: String,
    solver: Option<String>,
    solver_claimed_at: Option<u64>,
    tron_tx_id: Option<String>,
    tron_block_number: Option<String>,
    solved: bool,
    funded: bool,
    settled: bool,
    closed: bool,
}

fn ledger_payload(event: &EventAppended) -> Result<serde_json::Value> {
    let mut payload = serde_json::to_value(&event.args).map_err(|e| Error::MalformedArg {
        instance: event.instance,
        event_type: event.event_type.clone(),
        event_seq: event.event_seq,
        name: "args",
        reason: e.to_string(),
    })?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert(
            "block_timestamp".to_string(),
            json!(event.block_timestamp),
        );
    }
    Ok(payload)
}

async fn current_intent(
    tx: &mut dyn ProjectionTx,
    instance: InstanceKey,
    event: &EventAppended,
    id_hex: &str,
) -> Result<IntentRow> {
    let payload = tx
        .versioned_current(instance, FAMILY_INTENT, id_hex)
        .await?
        .ok_or_else(|| Error::MissingCurrent {
            instance,
            family: FAMILY_INTENT,
            key: id_hex.to_string(),
            event_seq: event.event_seq,
        })?;
    serde_json::from_value(payload).map_err(|e| Error::MalformedArg {
        instance,
        event_type: event.event_type.clone(),
        event_seq: event.event_seq,
        name: "intent",
        reason: e.to_string(),
    })
}

/// Applies `PoolEvent`s to the versioned Ownership/RecommendedFee/
/// ReceiverIntentParams/ReceiverIntentFeeSnap/Intent families and the
/// `IntentClaimed`/`IntentUnclaimed`/`IntentSolved`/`IntentFunded`/
/// `IntentSettled`/`IntentClosed` ledgers.
pub struct PoolInterpreter;

#[async_trait]
impl Interpreter for PoolInterpreter {
    async fn apply_one(
        &self,
        tx: &mut dyn ProjectionTx,
        instance: InstanceKey,
        event: &EventAppended,
    ) -> Result<()> {
        match event.event_type.as_str() {
            "OwnershipTransferred" => {
                let row = OwnershipRow {
                    old_owner: arg_text(instance, event, "old_owner")?.to_string(),
                    new_owner: arg_text(instance, event, "new_owner")?.to_string(),
                };
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_OWNERSHIP,
                    SINGLETON_KEY,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "RecommendedIntentFeeSet" => {
                let row = RecommendedFeeRow {
                    fee_ppm: arg_text(instance, event, "fee_ppm")?.to_string(),
                    fee_flat: arg_text(instance, event, "fee_flat")?.to_string(),
                };
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_RECOMMENDED_FEE,
                    SINGLETON_KEY,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "ReceiverIntentParams" => {
                let id = arg_b256(instance, event, "id")?;
                let forwarder = arg_address(instance, event, "forwarder")?;
                let to_tron_evm = arg_address(instance, event, "to_tron")?;
                let row = ReceiverIntentParamsRow {
                    forwarder: hex_address(forwarder),
                    to_tron_evm: hex_address(to_tron_evm),
                    to_tron: to_tron_base58(to_tron_evm),
                    forward_salt: arg_text(instance, event, "forward_salt")?.to_string(),
                    token: arg_text(instance, event, "token")?.to_string(),
                    amount_param: arg_text(instance, event, "amount")?.to_string(),
                    intent_hash: hex_b256(intent_hash(forwarder, to_tron_evm)),
                };
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_RECEIVER_INTENT_PARAMS,
                    &hex_b256(id),
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "ReceiverIntentFeeSnap" => {
                let id = arg_b256(instance, event, "id")?;
                let row = ReceiverIntentFeeSnapRow {
                    fee_ppm: arg_text(instance, event, "fee_ppm")?.to_string(),
                    fee_flat: arg_text(instance, event, "fee_flat")?.to_string(),
                    tron_payment_amount: arg_text(instance, event, "tron_payment_amount")?
                        .to_string(),
                };
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_RECEIVER_INTENT_FEE_SNAP,
                    &hex_b256(id),
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "IntentCreated" => {
                let id = arg_b256(instance, event, "id")?;
                let intent_type = arg_u64(instance, event, "intent_type")?;
                if intent_type > 3 {
                    return Err(Error::InvalidIntentType {
                        instance,
                        event_seq: event.event_seq,
                        value: intent_type,
                    });
                }
                let row = IntentRow {
                    creator: arg_text(instance, event, "creator")?.to_string(),
                    intent_type: intent_type as u8,
                    escrow_token: arg_text(instance, event, "token")?.to_string(),
                    escrow_amount: arg_text(instance, event, "amount")?.to_string(),
                    refund_beneficiary: arg_text(instance, event, "refund_beneficiary")?
                        .to_string(),
                    deadline: arg_text(instance, event, "deadline")?.to_string(),
                    intent_specs: arg_text(instance, event, "intent_specs")?.to_string(),
                    solver: None,
                    solver_claimed_at: None,
                    tron_tx_id: None,
                    tron_block_number: None,
                    solved: false,
                    funded: false,
                    settled: false,
                    closed: false,
                };
                // A current row for this id should never exist yet, but
                // close it if it somehow does.
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_INTENT,
                    &hex_b256(id),
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "IntentClaimed" => {
                let id = arg_b256(instance, event, "id")?;
                let id_hex = hex_b256(id);
                let mut row = current_intent(tx, instance, event, &id_hex).await?;
                tx.ledger_append(instance, "IntentClaimed", event.event_seq, ledger_payload(event)?)
                    .await?;
                row.solver = Some(arg_text(instance, event, "solver")?.to_string());
                row.solver_claimed_at = Some(event.block_timestamp);
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_INTENT,
                    &id_hex,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "IntentUnclaimed" => {
                let id = arg_b256(instance, event, "id")?;
                let id_hex = hex_b256(id);
                let mut row = current_intent(tx, instance, event, &id_hex).await?;
                tx.ledger_append(
                    instance,
                    "IntentUnclaimed",
                    event.event_seq,
                    ledger_payload(event)?,
                )
                .await?;
                row.solver = None;
                row.solver_claimed_at = None;
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_INTENT,
                    &id_hex,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "IntentSolved" => {
                let id = arg_b256(instance, event, "id")?;
                let id_hex = hex_b256(id);
                let mut row = current_intent(tx, instance, event, &id_hex).await?;
                tx.ledger_append(instance, "IntentSolved", event.event_seq, ledger_payload(event)?)
                    .await?;
                row.solved = true;
                row.solver = Some(arg_text(instance, event, "solver")?.to_string());
                row.solver_claimed_at = Some(event.block_timestamp);
                row.tron_tx_id = Some(arg_text(instance, event, "tron_tx_id")?.to_string());
                row.tron_block_number =
                    Some(arg_text(instance, event, "tron_block_number")?.to_string());
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_INTENT,
                    &id_hex,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "IntentFunded" => {
                let id = arg_b256(instance, event, "id")?;
                let id_hex = hex_b256(id);
                let mut row = current_intent(tx, instance, event, &id_hex).await?;
                tx.ledger_append(instance, "IntentFunded", event.event_seq, ledger_payload(event)?)
                    .await?;
                if row.funded {
                    // Idempotent: duplicate funding notice, no version churn.
                    return Ok(());
                }
                row.funded = true;
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_INTENT,
                    &id_hex,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "IntentSettled" => {
                let id = arg_b256(instance, event, "id")?;
                let id_hex = hex_b256(id);
                let mut row = current_intent(tx, instance, event, &id_hex).await?;
                tx.ledger_append(
                    instance,
                    "IntentSettled",
                    event.event_seq,
                    ledger_payload(event)?,
                )
                .await?;
                if row.settled {
                    return Ok(());
                }
                row.settled = true;
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_INTENT,
                    &id_hex,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "IntentClosed" => {
                let id = arg_b256(instance, event, "id")?;
                let id_hex = hex_b256(id);
                let mut row = current_intent(tx, instance, event, &id_hex).await?;
                tx.ledger_append(instance, "IntentClosed", event.event_seq, ledger_payload(event)?)
                    .await?;
                row.solver = None;
                row.solver_claimed_at = None;
                row.solved = arg_bool(instance, event, "solved")?;
                row.funded = arg_bool(instance, event, "funded")?;
                row.settled = arg_bool(instance, event, "settled")?;
                row.closed = true;
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_INTENT,
                    &id_hex,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            other => {
                tracing::warn!(
                    %instance,
                    event_type = other,
                    event_seq = event.event_seq,
                    "ignoring unrecognized pool event_type"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Stream;
    use crate::interpreter::args;
    use crate::model::{ArgValue, Instance, NewEvent};
    use crate::registry::genesis_tip_for;
    use crate::store::EventStore;
    use crate::store::memory::MemoryStore;
    use alloy_primitives::{Address, B256};

    fn base_event(
        instance: InstanceKey,
        seq: u64,
        prev_tip: B256,
        new_tip: B256,
        event_type: &str,
        args: crate::model::Args,
    ) -> NewEvent {
        NewEvent {
            instance,
            event_seq: seq,
            prev_tip,
            new_tip,
            event_signature: B256::ZERO,
            abi_encoded_event_data: Vec::new(),
            event_type: event_type.to_string(),
            args,
            block_number: seq,
            block_timestamp: 1_000 + seq,
            block_hash: B256::ZERO,
            tx_hash: B256::ZERO,
            log_index: 0,
        }
    }

    async fn setup() -> (MemoryStore, InstanceKey, B256) {
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
        (store, instance, genesis)
    }

    #[tokio::test]
    async fn intent_lifecycle_claim_fund_settle_close() {
        let (store, instance, genesis) = setup().await;
        let id = B256::repeat_byte(0x07);
        let solver = Address::repeat_byte(0x09);

        let created = base_event(
            instance,
            1,
            genesis,
            B256::repeat_byte(1),
            "IntentCreated",
            args([
                ("id", ArgValue::Text(format!("0x{}", hex::encode(id)))),
                ("creator", ArgValue::Text(hex_address(Address::ZERO))),
                ("intent_type", ArgValue::Text("1".to_string())),
                ("token", ArgValue::Text(hex_address(Address::ZERO))),
                ("amount", ArgValue::Text("1000".to_string())),
                (
                    "refund_beneficiary",
                    ArgValue::Text(hex_address(Address::ZERO)),
                ),
                ("deadline", ArgValue::Text("9999".to_string())),
                ("intent_specs", ArgValue::Text("0x".to_string())),
            ]),
        );

        let claimed = base_event(
            instance,
            2,
            B256::repeat_byte(1),
            B256::repeat_byte(2),
            "IntentClaimed",
            args([
                ("id", ArgValue::Text(format!("0x{}", hex::encode(id)))),
                ("solver", ArgValue::Text(hex_address(solver))),
                ("deposit_amount", ArgValue::Text("500".to_string())),
            ]),
        );

        let funded = base_event(
            instance,
            3,
            B256::repeat_byte(2),
            B256::repeat_byte(3),
            "IntentFunded",
            args([
                ("id", ArgValue::Text(format!("0x{}", hex::encode(id)))),
                ("funder", ArgValue::Text(hex_address(Address::ZERO))),
                ("token", ArgValue::Text(hex_address(Address::ZERO))),
                ("amount", ArgValue::Text("1000".to_string())),
            ]),
        );

        store
            .append_events(vec![created, claimed, funded])
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let applied =
            crate::catchup::apply_catchup(&mut *tx, &PoolInterpreter, instance, 3)
                .await
                .unwrap();
        assert_eq!(applied, 3);

        let current = tx
            .versioned_current(instance, FAMILY_INTENT, &hex_b256(id))
            .await
            .unwrap()
            .unwrap();
        let row: IntentRow = serde_json::from_value(current).unwrap();
        assert_eq!(row.solver.as_deref(), Some(hex_address(solver)).as_deref());
        assert!(row.funded);
        assert!(!row.settled);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn intent_funded_twice_is_idempotent() {
        let (store, instance, genesis) = setup().await;
        let id = B256::repeat_byte(0x11);

        let created = base_event(
            instance,
            1,
            genesis,
            B256::repeat_byte(1),
            "IntentCreated",
            args([
                ("id", ArgValue::Text(format!("0x{}", hex::encode(id)))),
                ("creator", ArgValue::Text(hex_address(Address::ZERO))),
                ("intent_type", ArgValue::Text("0".to_string())),
                ("token", ArgValue::Text(hex_address(Address::ZERO))),
                ("amount", ArgValue::Text("1".to_string())),
                (
                    "refund_beneficiary",
                    ArgValue::Text(hex_address(Address::ZERO)),
                ),
                ("deadline", ArgValue::Text("1".to_string())),
                ("intent_specs", ArgValue::Text("0x".to_string())),
            ]),
        );

        let fund_args = || {
            args([
                ("id", ArgValue::Text(format!("0x{}", hex::encode(id)))),
                ("funder", ArgValue::Text(hex_address(Address::ZERO))),
                ("token", ArgValue::Text(hex_address(Address::ZERO))),
                ("amount", ArgValue::Text("1".to_string())),
            ])
        };

        let funded_once = base_event(
            instance,
            2,
            B256::repeat_byte(1),
            B256::repeat_byte(2),
            "IntentFunded",
            fund_args(),
        );
        let funded_twice = base_event(
            instance,
            3,
            B256::repeat_byte(2),
            B256::repeat_byte(3),
            "IntentFunded",
            fund_args(),
        );

        store
            .append_events(vec![created, funded_once, funded_twice])
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        crate::catchup::apply_catchup(&mut *tx, &PoolInterpreter, instance, 3)
            .await
            .unwrap();

        let current = tx
            .versioned_current(instance, FAMILY_INTENT, &hex_b256(id))
            .await
            .unwrap()
            .unwrap();
        let row: IntentRow = serde_json::from_value(current).unwrap();
        assert!(row.funded);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_intent_type_is_rejected() {
        let (store, instance, genesis) = setup().await;
        let id = B256::repeat_byte(0x22);
        let created = base_event(
            instance,
            1,
            genesis,
            B256::repeat_byte(1),
            "IntentCreated",
            args([
                ("id", ArgValue::Text(format!("0x{}", hex::encode(id)))),
                ("creator", ArgValue::Text(hex_address(Address::ZERO))),
                ("intent_type", ArgValue::Text("9".to_string())),
                ("token", ArgValue::Text(hex_address(Address::ZERO))),
                ("amount", ArgValue::Text("1".to_string())),
                (
                    "refund_beneficiary",
                    ArgValue::Text(hex_address(Address::ZERO)),
                ),
                ("deadline", ArgValue::Text("1".to_string())),
                ("intent_specs", ArgValue::Text("0x".to_string())),
            ]),
        );
        store.append_events(vec![created]).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = crate::catchup::apply_catchup(&mut *tx, &PoolInterpreter, instance, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidIntentType { .. }));
    }
}
