//! Event store abstraction and the transactional surface the catch-up and
//! rollback engines drive.
//!
//! Two implementations live here: [`postgres`], the durable `sqlx`-backed
//! backend, and [`memory`], an in-process backend used by this crate's own
//! tests so the engine's logic can be exercised without a database.

pub mod memory;
pub mod postgres;

use crate::error::Result;
use crate::ids::InstanceKey;
use crate::model::{EventAppended, Instance, NewEvent, StreamCursor};
use async_trait::async_trait;

/// A contiguous range of `event_seq` values, used by
/// [`EventStore::set_canonical`]. `to_seq = None` means "open ended",
/// for flipping everything from a block onward with no upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    /// First sequence number in the range (inclusive).
    pub from_seq: u64,
    /// Last sequence number in the range (inclusive), or `None` for open-ended.
    pub to_seq: Option<u64>,
}

impl SeqRange {
    /// `[from_seq, ∞)`.
    pub const fn from(from_seq: u64) -> Self {
        Self {
            from_seq,
            to_seq: None,
        }
    }

    /// `[from_seq, to_seq]`.
    pub const fn between(from_seq: u64, to_seq: u64) -> Self {
        Self {
            from_seq,
            to_seq: Some(to_seq),
        }
    }

    fn contains(&self, seq: u64) -> bool {
        seq >= self.from_seq && self.to_seq.map_or(true, |to| seq <= to)
    }
}

/// Durable storage of raw events, instances, and cursors, plus the
/// transactional surface catch-up/rollback run inside.
///
/// Implementors must trigger nothing themselves: dispatch is an explicit
/// caller-driven step (see [`crate::dispatch`]), not something the store
/// does on its own.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert (or re-insert, idempotently) the instance and initialize its
    /// cursor to `(applied_through_seq = 0, tip = genesis_tip)`. Idempotent
    /// on identical calls; returns [`crate::Error::AlreadyConfigured`] if the
    /// instance already exists with a different `genesis_tip`.
    async fn configure_instance(&self, instance: Instance) -> Result<()>;

    /// Fetch a configured instance, if any.
    async fn get_instance(&self, key: InstanceKey) -> Result<Option<Instance>>;

    /// Bulk-insert new event rows. Every inserted row starts
    /// `canonical = true`; an ingester that discovers a row is already
    /// non-canonical at insertion time (replaying a known-reorged range)
    /// follows up with [`EventStore::set_canonical`]. Returns the distinct
    /// set of instances that received at least one row, for the dispatcher
    /// to drive catch-up on.
    async fn append_events(&self, rows: Vec<NewEvent>) -> Result<Vec<InstanceKey>>;

    /// Flip the `canonical` flag for a contiguous range of an instance's
    /// rows. Rows are never deleted by this call. Returns the `event_seq`
    /// values whose flag actually changed, for the dispatcher to compute
    /// `rollback_seq` from.
    async fn set_canonical(
        &self,
        instance: InstanceKey,
        range: SeqRange,
        canonical: bool,
    ) -> Result<Vec<u64>>;

    /// Open a transaction scoping one catch-up or one rollback-then-catch-up
    /// — the entire catch-up runs inside one database transaction.
    async fn begin(&self) -> Result<Box<dyn ProjectionTx>>;
}

/// The transactional surface used by [`crate::catchup::apply_catchup`] and
/// [`crate::rollback::rollback_from`]. A single transaction backs exactly
/// one catch-up call or one rollback-then-catch-up composition per instance.
#[async_trait]
pub trait ProjectionTx: Send {
    /// Fetch the configured instance (for its `genesis_tip`).
    async fn get_instance(&mut self, instance: InstanceKey) -> Result<Option<Instance>>;

    /// Load the cursor under an exclusive, transaction-scoped lock.
    async fn load_cursor_for_update(&mut self, instance: InstanceKey) -> Result<Option<StreamCursor>>;

    /// Persist the cursor.
    async fn save_cursor(&mut self, instance: InstanceKey, cursor: StreamCursor) -> Result<()>;

    /// Fetch the canonical event at `seq` for `instance`, honoring whatever
    /// canonicality flips are visible within this transaction — rollback's
    /// tip recomputation must use the post-flip canonical set.
    async fn get_canonical_event(
        &mut self,
        instance: InstanceKey,
        seq: u64,
    ) -> Result<Option<EventAppended>>;

    /// Current payload for `(family, key)`, if a row with
    /// `valid_to_seq = null` exists.
    async fn versioned_current(
        &mut self,
        instance: InstanceKey,
        family: &'static str,
        key: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// Close the current row (if any) for `(family, key)` at `event_seq`
    /// and insert a new current row with the given payload.
    async fn versioned_close_and_insert(
        &mut self,
        instance: InstanceKey,
        family: &'static str,
        key: &str,
        event_seq: u64,
        payload: serde_json::Value,
    ) -> Result<()>;

    /// Undo the suffix of every versioned family for `instance`: delete
    /// rows with `valid_from_seq >= rollback_seq`, and reopen (set
    /// `valid_to_seq = null`) rows with `valid_to_seq >= rollback_seq`.
    async fn versioned_rollback(&mut self, instance: InstanceKey, rollback_seq: u64) -> Result<()>;

    /// Append a ledger row.
    async fn ledger_append(
        &mut self,
        instance: InstanceKey,
        family: &'static str,
        event_seq: u64,
        payload: serde_json::Value,
    ) -> Result<()>;

    /// Delete ledger rows for `instance` with `event_seq >= rollback_seq`.
    async fn ledger_rollback(&mut self, instance: InstanceKey, rollback_seq: u64) -> Result<()>;

    /// Commit all writes made through this transaction.
    async fn commit(self: Box<Self>) -> Result<()>;
}
