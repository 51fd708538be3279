//! The per-stream interpretation seam.
//!
//! [`Interpreter`] is what `apply_catchup` calls for every canonical event;
//! [`pool`](crate::pool) and [`forwarder`](crate::forwarder) are its two
//! implementors, one event type to one handler each.

use crate::error::{Error, Result};
use crate::ids::InstanceKey;
use crate::model::{Args, EventAppended};
use crate::store::ProjectionTx;
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use std::str::FromStr;

/// Applies one canonical event's effects to `tx`'s versioned rows and
/// ledgers. Implementors must be total over `event.event_type`: an unknown
/// tag is logged and skipped, never an error, so a deployed instance never
/// jams on an event type from a future contract upgrade.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Apply `event`'s effects within `tx`.
    async fn apply_one(
        &self,
        tx: &mut dyn ProjectionTx,
        instance: InstanceKey,
        event: &EventAppended,
    ) -> Result<()>;
}

/// Look up a required `args` field as text, or fail with [`Error::MissingArg`].
pub(crate) fn arg_text<'a>(
    instance: InstanceKey,
    event: &'a EventAppended,
    name: &'static str,
) -> Result<&'a str> {
    event
        .args
        .get(name)
        .and_then(|v| v.text())
        .ok_or_else(|| Error::MissingArg {
            instance,
            event_type: event.event_type.clone(),
            event_seq: event.event_seq,
            name,
        })
}

/// Look up a required `args` field as a bool, or fail with [`Error::MissingArg`].
pub(crate) fn arg_bool(
    instance: InstanceKey,
    event: &EventAppended,
    name: &'static str,
) -> Result<bool> {
    event
        .args
        .get(name)
        .and_then(|v| v.bool())
        .ok_or_else(|| Error::MissingArg {
            instance,
            event_type: event.event_type.clone(),
            event_seq: event.event_seq,
            name,
        })
}

/// Parse a required text field as an EVM address.
pub(crate) fn arg_address(
    instance: InstanceKey,
    event: &EventAppended,
    name: &'static str,
) -> Result<Address> {
    let text = arg_text(instance, event, name)?;
    Address::from_str(text).map_err(|e| Error::MalformedArg {
        instance,
        event_type: event.event_type.clone(),
        event_seq: event.event_seq,
        name,
        reason: e.to_string(),
    })
}

/// Parse a required text field as a `bytes32`.
pub(crate) fn arg_b256(
    instance: InstanceKey,
    event: &EventAppended,
    name: &'static str,
) -> Result<B256> {
    let text = arg_text(instance, event, name)?;
    B256::from_str(text).map_err(|e| Error::MalformedArg {
        instance,
        event_type: event.event_type.clone(),
        event_seq: event.event_seq,
        name,
        reason: e.to_string(),
    })
}

/// Parse a required text field as a `bytes` blob (`0x`-prefixed hex).
pub(crate) fn arg_bytes(
    instance: InstanceKey,
    event: &EventAppended,
    name: &'static str,
) -> Result<Vec<u8>> {
    let text = arg_text(instance, event, name)?;
    hex::decode(text.trim_start_matches("0x")).map_err(|e| Error::MalformedArg {
        instance,
        event_type: event.event_type.clone(),
        event_seq: event.event_seq,
        name,
        reason: e.to_string(),
    })
}

/// Parse a required text field as a decimal-string-encoded `u64`.
pub(crate) fn arg_u64(
    instance: InstanceKey,
    event: &EventAppended,
    name: &'static str,
) -> Result<u64> {
    let text = arg_text(instance, event, name)?;
    text.parse::<u64>().map_err(|e| Error::MalformedArg {
        instance,
        event_type: event.event_type.clone(),
        event_seq: event.event_seq,
        name,
        reason: e.to_string(),
    })
}

/// Parse a required text field as a decimal-string-encoded `u128` (`uint256`
/// amounts that always fit in 128 bits in this protocol: fee bps, USDT
/// amounts).
pub(crate) fn arg_u128(
    instance: InstanceKey,
    event: &EventAppended,
    name: &'static str,
) -> Result<u128> {
    let text = arg_text(instance, event, name)?;
    text.parse::<u128>().map_err(|e| Error::MalformedArg {
        instance,
        event_type: event.event_type.clone(),
        event_seq: event.event_seq,
        name,
        reason: e.to_string(),
    })
}

/// Render an address as `0x`-prefixed lowercase hex, for use as a
/// versioned-row entity key or a JSON payload field.
pub(crate) fn hex_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_slice()))
}

/// Render a `bytes32` as `0x`-prefixed lowercase hex.
pub(crate) fn hex_b256(b: B256) -> String {
    format!("0x{}", hex::encode(b.as_slice()))
}

/// Build the `args` payload this crate expects to see on a freshly-decoded
/// event, for use from ingester-side adapters and from this crate's own
/// tests. Exists so callers don't hand-construct a `BTreeMap` literal at
/// every call site.
#[cfg(test)]
pub(crate) fn args(pairs: impl IntoIterator<Item = (&'static str, crate::model::ArgValue)>) -> Args {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
