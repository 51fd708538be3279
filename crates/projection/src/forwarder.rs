//! Forwarder stream interpreter.
//!
//! One interpreter instance is shared across every configured Forwarder
//! instance; all reads and writes are scoped by the `instance` argument
//! `apply_catchup` passes through, so there is no shared mutable state
//! across chains.

use crate::error::{Error, Result};
use crate::ids::InstanceKey;
use crate::interpreter::{Interpreter, arg_address, arg_b256, arg_bool, arg_text, hex_b256};
use crate::model::EventAppended;
use crate::store::ProjectionTx;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

const SINGLETON_KEY: &str = "singleton";

const FAMILY_OWNERSHIP: &str = "Ownership";
const FAMILY_BRIDGERS: &str = "Bridgers";
const FAMILY_QUOTER: &str = "Quoter";
const FAMILY_RECEIVER: &str = "Receiver";
const FAMILY_FORWARD: &str = "Forward";

#[derive(Debug, Serialize, Deserialize)]
struct OwnershipRow {
    old_owner: String,
    new_owner: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BridgersRow {
    usdt_bridger: String,
    usdc_bridger: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuoterRow {
    quoter: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReceiverRow {
    receiver: String,
    implementation: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ForwardRow {
    base_receiver_salt: String,
    forward_salt: String,
    intent_hash: String,
    target_chain: String,
    beneficiary: String,
    beneficiary_claim_only: bool,
    balance_param: String,
    token_in: String,
    token_out: String,
    receiver_used: String,
    ephemeral_receiver: String,
    started_at: u64,
    completed_at: Option<u64>,
    ephemeral: Option<bool>,
    amount_pulled: Option<String>,
    amount_forwarded: Option<String>,
    relayer_rebate: Option<String>,
    msg_value_refunded: Option<String>,
    settled_locally: Option<bool>,
    bridger: Option<String>,
    expected_bridge_out: Option<String>,
    bridge_data_hash: Option<String>,
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
        obj.insert("block_timestamp".to_string(), json!(event.block_timestamp));
    }
    Ok(payload)
}

/// Applies `ForwarderEvent`s to the versioned Ownership/Bridgers/Quoter/
/// Receiver/Forward families and the `SwapExecuted`/`BridgeInitiated`
/// ledgers.
pub struct ForwarderInterpreter;

#[async_trait]
impl Interpreter for ForwarderInterpreter {
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

            "BridgersSet" => {
                let row = BridgersRow {
                    usdt_bridger: arg_text(instance, event, "usdt_bridger")?.to_string(),
                    usdc_bridger: arg_text(instance, event, "usdc_bridger")?.to_string(),
                };
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_BRIDGERS,
                    SINGLETON_KEY,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "QuoterSet" => {
                let token_in = arg_address(instance, event, "token_in")?;
                let row = QuoterRow {
                    quoter: arg_text(instance, event, "quoter")?.to_string(),
                };
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_QUOTER,
                    &crate::interpreter::hex_address(token_in),
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "ReceiverDeployed" => {
                let receiver_salt = arg_b256(instance, event, "receiver_salt")?;
                let row = ReceiverRow {
                    receiver: arg_text(instance, event, "receiver")?.to_string(),
                    implementation: arg_text(instance, event, "implementation")?.to_string(),
                };
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_RECEIVER,
                    &hex_b256(receiver_salt),
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "ForwardStarted" => {
                let forward_id = arg_b256(instance, event, "forward_id")?;
                let row = ForwardRow {
                    base_receiver_salt: arg_text(instance, event, "base_receiver_salt")?
                        .to_string(),
                    forward_salt: arg_text(instance, event, "forward_salt")?.to_string(),
                    intent_hash: arg_text(instance, event, "intent_hash")?.to_string(),
                    target_chain: arg_text(instance, event, "target_chain")?.to_string(),
                    beneficiary: arg_text(instance, event, "beneficiary")?.to_string(),
                    beneficiary_claim_only: arg_bool(instance, event, "beneficiary_claim_only")?,
                    balance_param: arg_text(instance, event, "balance_param")?.to_string(),
                    token_in: arg_text(instance, event, "token_in")?.to_string(),
                    token_out: arg_text(instance, event, "token_out")?.to_string(),
                    receiver_used: arg_text(instance, event, "receiver_used")?.to_string(),
                    ephemeral_receiver: arg_text(instance, event, "ephemeral_receiver")?
                        .to_string(),
                    started_at: event.block_timestamp,
                    completed_at: None,
                    ephemeral: None,
                    amount_pulled: None,
                    amount_forwarded: None,
                    relayer_rebate: None,
                    msg_value_refunded: None,
                    settled_locally: None,
                    bridger: None,
                    expected_bridge_out: None,
                    bridge_data_hash: None,
                };
                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_FORWARD,
                    &hex_b256(forward_id),
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "ForwardCompleted" => {
                let forward_id = arg_b256(instance, event, "forward_id")?;
                let key = hex_b256(forward_id);
                let current = tx
                    .versioned_current(instance, FAMILY_FORWARD, &key)
                    .await?
                    .ok_or(Error::CompletedWithoutStarted {
                        instance,
                        forward_id,
                    })?;
                let mut row: ForwardRow =
                    serde_json::from_value(current).map_err(|e| Error::MalformedArg {
                        instance,
                        event_type: event.event_type.clone(),
                        event_seq: event.event_seq,
                        name: "forward",
                        reason: e.to_string(),
                    })?;

                row.completed_at = Some(event.block_timestamp);
                row.ephemeral = Some(arg_bool(instance, event, "ephemeral")?);
                row.amount_pulled = Some(arg_text(instance, event, "amount_pulled")?.to_string());
                row.amount_forwarded =
                    Some(arg_text(instance, event, "amount_forwarded")?.to_string());
                row.relayer_rebate =
                    Some(arg_text(instance, event, "relayer_rebate")?.to_string());
                row.msg_value_refunded =
                    Some(arg_text(instance, event, "msg_value_refunded")?.to_string());
                row.settled_locally = Some(arg_bool(instance, event, "settled_locally")?);
                row.bridger = Some(arg_text(instance, event, "bridger")?.to_string());
                row.expected_bridge_out =
                    Some(arg_text(instance, event, "expected_bridge_out")?.to_string());
                row.bridge_data_hash =
                    Some(arg_text(instance, event, "bridge_data_hash")?.to_string());

                tx.versioned_close_and_insert(
                    instance,
                    FAMILY_FORWARD,
                    &key,
                    event.event_seq,
                    serde_json::to_value(row).expect("serializable"),
                )
                .await
            }

            "SwapExecuted" => {
                tx.ledger_append(instance, "SwapExecuted", event.event_seq, ledger_payload(event)?)
                    .await
            }

            "BridgeInitiated" => {
                tx.ledger_append(
                    instance,
                    "BridgeInitiated",
                    event.event_seq,
                    ledger_payload(event)?,
                )
                .await
            }

            other => {
                tracing::warn!(
                    %instance,
                    event_type = other,
                    event_seq = event.event_seq,
                    "ignoring unrecognized forwarder event_type"
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
            block_timestamp: 2_000 + seq,
            block_hash: B256::ZERO,
            tx_hash: B256::ZERO,
            log_index: 0,
        }
    }

    #[tokio::test]
    async fn forward_completed_without_started_fails() {
        let store = MemoryStore::new();
        let instance = InstanceKey::new(Stream::Forwarder, 10, Address::repeat_byte(0x05));
        let genesis = genesis_tip_for(instance.stream.index_name());
        store
            .configure_instance(Instance {
                key: instance,
                genesis_tip: genesis,
            })
            .await
            .unwrap();

        let forward_id = B256::repeat_byte(0x33);
        let completed = base_event(
            instance,
            1,
            genesis,
            B256::repeat_byte(1),
            "ForwardCompleted",
            args([
                (
                    "forward_id",
                    ArgValue::Text(format!("0x{}", hex::encode(forward_id))),
                ),
                ("ephemeral", ArgValue::Bool(false)),
                ("amount_pulled", ArgValue::Text("1".to_string())),
                ("amount_forwarded", ArgValue::Text("1".to_string())),
                ("relayer_rebate", ArgValue::Text("0".to_string())),
                ("msg_value_refunded", ArgValue::Text("0".to_string())),
                ("settled_locally", ArgValue::Bool(true)),
                (
                    "bridger",
                    ArgValue::Text(crate::interpreter::hex_address(Address::ZERO)),
                ),
                ("expected_bridge_out", ArgValue::Text("0".to_string())),
                (
                    "bridge_data_hash",
                    ArgValue::Text(format!("0x{}", hex::encode(B256::ZERO))),
                ),
            ]),
        );
        store.append_events(vec![completed]).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = crate::catchup::apply_catchup(&mut *tx, &ForwarderInterpreter, instance, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CompletedWithoutStarted { .. }));
    }

    #[tokio::test]
    async fn forward_started_then_completed_versions_forward() {
        let store = MemoryStore::new();
        let instance = InstanceKey::new(Stream::Forwarder, 10, Address::repeat_byte(0x05));
        let genesis = genesis_tip_for(instance.stream.index_name());
        store
            .configure_instance(Instance {
                key: instance,
                genesis_tip: genesis,
            })
            .await
            .unwrap();

        let forward_id = B256::repeat_byte(0x44);
        let addr = crate::interpreter::hex_address(Address::ZERO);
        let b256_zero = format!("0x{}", hex::encode(B256::ZERO));

        let started = base_event(
            instance,
            1,
            genesis,
            B256::repeat_byte(1),
            "ForwardStarted",
            args([
                (
                    "forward_id",
                    ArgValue::Text(format!("0x{}", hex::encode(forward_id))),
                ),
                ("base_receiver_salt", ArgValue::Text(b256_zero.clone())),
                ("forward_salt", ArgValue::Text(b256_zero.clone())),
                ("intent_hash", ArgValue::Text(b256_zero.clone())),
                ("target_chain", ArgValue::Text("1".to_string())),
                ("beneficiary", ArgValue::Text(addr.clone())),
                ("beneficiary_claim_only", ArgValue::Bool(false)),
                ("balance_param", ArgValue::Text("0".to_string())),
                ("token_in", ArgValue::Text(addr.clone())),
                ("token_out", ArgValue::Text(addr.clone())),
                ("receiver_used", ArgValue::Text(addr.clone())),
                ("ephemeral_receiver", ArgValue::Text(addr.clone())),
            ]),
        );

        let completed = base_event(
            instance,
            2,
            B256::repeat_byte(1),
            B256::repeat_byte(2),
            "ForwardCompleted",
            args([
                (
                    "forward_id",
                    ArgValue::Text(format!("0x{}", hex::encode(forward_id))),
                ),
                ("ephemeral", ArgValue::Bool(false)),
                ("amount_pulled", ArgValue::Text("10".to_string())),
                ("amount_forwarded", ArgValue::Text("9".to_string())),
                ("relayer_rebate", ArgValue::Text("1".to_string())),
                ("msg_value_refunded", ArgValue::Text("0".to_string())),
                ("settled_locally", ArgValue::Bool(true)),
                ("bridger", ArgValue::Text(addr.clone())),
                ("expected_bridge_out", ArgValue::Text("9".to_string())),
                ("bridge_data_hash", ArgValue::Text(b256_zero.clone())),
            ]),
        );

        store.append_events(vec![started, completed]).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        crate::catchup::apply_catchup(&mut *tx, &ForwarderInterpreter, instance, 2)
            .await
            .unwrap();

        let current = tx
            .versioned_current(instance, FAMILY_FORWARD, &hex_b256(forward_id))
            .await
            .unwrap()
            .unwrap();
        let row: ForwardRow = serde_json::from_value(current).unwrap();
        assert_eq!(row.completed_at, Some(2_002));
        assert_eq!(row.amount_forwarded.as_deref(), Some("9"));
        tx.commit().await.unwrap();
    }
}
