//! Error taxonomy for the projection engine.
//!
//! Callers match on these variants directly rather than inspecting error
//! text.

use crate::ids::InstanceKey;
use alloy_primitives::B256;

/// Every failure mode the projection engine can surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `apply_catchup`/`rollback_from` called for an instance with no
    /// configured cursor. Requires an administrative `configure_instance`
    /// call; not retryable by the engine itself.
    #[error("instance not configured: {0}")]
    NotConfigured(InstanceKey),

    /// `configure_instance` called twice for the same instance with a
    /// different `genesis_tip`.
    #[error(
        "instance already configured with a different genesis_tip: {instance} \
         (existing={existing}, requested={requested})"
    )]
    AlreadyConfigured {
        /// The instance in question.
        instance: InstanceKey,
        /// The genesis tip already on record.
        existing: B256,
        /// The genesis tip the caller requested.
        requested: B256,
    },

    /// Hash-chain discontinuity: `event.prev_tip != cursor.tip`. Poison
    /// condition — the caller must abort the enclosing transaction and
    /// leave the instance at its last known consistent state.
    #[error(
        "tip mismatch for {instance} at event_seq={event_seq}: expected prev_tip={expected}, got {got}"
    )]
    TipMismatch {
        /// The instance in question.
        instance: InstanceKey,
        /// The event sequence number being applied.
        event_seq: u64,
        /// The cursor's current tip, which `prev_tip` was expected to equal.
        expected: B256,
        /// The event's actual `prev_tip`.
        got: B256,
    },

    /// `ForwardCompleted` observed for a `forward_id` with no current
    /// `ForwardStarted` row.
    #[error("{instance}: ForwardCompleted without a current ForwardStarted for forward_id={forward_id}")]
    CompletedWithoutStarted {
        /// The instance in question.
        instance: InstanceKey,
        /// The forward id that has no open `Forward` row.
        forward_id: B256,
    },

    /// A state-mutating event referenced a keyed entity with no current
    /// row (e.g. `IntentClaimed` for an unknown intent id).
    #[error("{instance}: no current '{family}' row for key {key} at event_seq={event_seq}")]
    MissingCurrent {
        /// The instance in question.
        instance: InstanceKey,
        /// The versioned entity family (e.g. "Intent").
        family: &'static str,
        /// The entity key, rendered as text.
        key: String,
        /// The event sequence number being applied.
        event_seq: u64,
    },

    /// An event's `args` mapping was missing a field the interpreter
    /// required for this `event_type`.
    #[error("{instance}: event_type={event_type} at event_seq={event_seq} missing required arg '{name}'")]
    MissingArg {
        /// The instance in question.
        instance: InstanceKey,
        /// The event type being interpreted.
        event_type: String,
        /// The event sequence number being applied.
        event_seq: u64,
        /// The name of the missing argument.
        name: &'static str,
    },

    /// `IntentCreated.intent_type` was outside `{0,1,2,3}`.
    #[error("{instance}: invalid intent_type {value} at event_seq={event_seq} (must be 0..=3)")]
    InvalidIntentType {
        /// The instance in question.
        instance: InstanceKey,
        /// The event sequence number being applied.
        event_seq: u64,
        /// The out-of-range value.
        value: u64,
    },

    /// An `args` field existed but was of the wrong shape for the event
    /// type's expected Solidity type.
    #[error("{instance}: event_type={event_type} at event_seq={event_seq} arg '{name}' has unexpected shape: {reason}")]
    MalformedArg {
        /// The instance in question.
        instance: InstanceKey,
        /// The event type being interpreted.
        event_type: String,
        /// The event sequence number being applied.
        event_seq: u64,
        /// The name of the malformed argument.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The backing event store failed (I/O, serialization failure,
    /// constraint violation, or — for the Postgres backend — a
    /// transient deadlock/serialization failure the caller should retry
    /// by re-running the whole triggering transaction).
    #[error("event store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the transient class of error: database
    /// deadlocks and serialization failures that the caller should retry
    /// by re-running the entire triggering transaction, as opposed to
    /// integrity errors that require a human to look at the event store.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}
