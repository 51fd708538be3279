//! Row shapes shared by every backend.

use crate::ids::InstanceKey;
use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A configured stream, as recorded by the instance registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance {
    /// The instance identity.
    pub key: InstanceKey,
    /// The hash-chain tip the stream starts from at `event_seq = 0`.
    pub genesis_tip: B256,
}

/// Per-instance projection progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCursor {
    /// The last canonical `event_seq` applied. `0` means nothing applied yet.
    pub applied_through_seq: u64,
    /// The hash-chain tip after `applied_through_seq` (`genesis_tip` when
    /// `applied_through_seq == 0`).
    pub tip: B256,
}

/// A structured event argument value. `EventAppended.args` is a mapping
/// from field name to one of these (addresses/ints as decimal strings,
/// `bytes`/`bytes32` as `0x`-hex, `bool` as JSON bool) before storing them
/// as `jsonb`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// A JSON string: decimal `uint*`, checksummed/lowercase `address`, or
    /// `0x`-prefixed hex for `bytes`/`bytes32`.
    Text(String),
    /// A `bool` event argument.
    Bool(bool),
}

impl ArgValue {
    /// Render as a `0x`-prefixed hex string, e.g. for bytes32 fields.
    pub fn text(&self) -> Option<&str> {
        match self {
            ArgValue::Text(s) => Some(s),
            ArgValue::Bool(_) => None,
        }
    }

    /// Render as a bool, for `bool` fields only.
    pub fn bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            ArgValue::Text(_) => None,
        }
    }
}

/// The structured argument mapping for one event (`EventAppended.args`).
pub type Args = BTreeMap<String, ArgValue>;

/// A canonical-or-not row in the event store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAppended {
    /// Surrogate primary key.
    pub id: i64,
    /// The instance this event belongs to.
    pub instance: InstanceKey,
    /// Monotonic per-instance sequence number, gap-free among canonical rows.
    pub event_seq: u64,
    /// Hash-chain tip immediately before this event.
    pub prev_tip: B256,
    /// Hash-chain tip immediately after this event.
    pub new_tip: B256,
    /// 32-byte event selector.
    pub event_signature: B256,
    /// Opaque ABI-encoded event payload as emitted on-chain.
    pub abi_encoded_event_data: Vec<u8>,
    /// Text tag identifying which entry of the dispatch table applies.
    pub event_type: String,
    /// Structured event arguments, already decoded from `abi_encoded_event_data`.
    pub args: Args,
    /// The containing block's number.
    pub block_number: u64,
    /// The containing block's unix timestamp, seconds.
    pub block_timestamp: u64,
    /// The containing block's hash.
    pub block_hash: B256,
    /// The emitting transaction's hash.
    pub tx_hash: B256,
    /// The log's index within the block.
    pub log_index: u32,
    /// Whether this row is currently considered part of canonical history.
    pub canonical: bool,
}

/// A not-yet-stored event row, as produced by the ingester and passed to
/// `EventStore::append_events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// The instance this event belongs to.
    pub instance: InstanceKey,
    /// Monotonic per-instance sequence number.
    pub event_seq: u64,
    /// Hash-chain tip immediately before this event.
    pub prev_tip: B256,
    /// Hash-chain tip immediately after this event.
    pub new_tip: B256,
    /// 32-byte event selector.
    pub event_signature: B256,
    /// Opaque ABI-encoded event payload as emitted on-chain.
    pub abi_encoded_event_data: Vec<u8>,
    /// Text tag identifying which entry of the dispatch table applies.
    pub event_type: String,
    /// Structured event arguments, already decoded from `abi_encoded_event_data`.
    pub args: Args,
    /// The containing block's number.
    pub block_number: u64,
    /// The containing block's unix timestamp, seconds.
    pub block_timestamp: u64,
    /// The containing block's hash.
    pub block_hash: B256,
    /// The emitting transaction's hash.
    pub tx_hash: B256,
    /// The log's index within the block.
    pub log_index: u32,
}
