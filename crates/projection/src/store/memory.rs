//! In-memory [`EventStore`] implementation.
//!
//! `Arc<Mutex<...>>`-backed. Exists so this crate's own tests can
//! exercise the catch-up/rollback engines and the two stream interpreters
//! without a Postgres instance.
//!
//! A transaction here is a per-instance changeset: [`MemoryTx`] starts
//! empty and lazily copies in only the instances it's actually asked
//! about (`ensure_loaded`), mutates that local copy, and on `commit`
//! merges back only the instances it touched. Two transactions open over
//! different instances at once never stomp on each other's writes, since
//! each only ever reads and writes the shared state through the slice it
//! copied for its own touched instances. Dropping a `MemoryTx` without
//! committing is exactly "the transaction rolled back", since the local
//! changeset is simply discarded.

use super::{EventStore, ProjectionTx, SeqRange};
use crate::error::{Error, Result};
use crate::ids::InstanceKey;
use crate::model::{EventAppended, Instance, NewEvent, StreamCursor};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
struct VersionedRow {
    valid_from_seq: u64,
    valid_to_seq: Option<u64>,
    payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct State {
    instances: BTreeMap<InstanceKey, Instance>,
    cursors: BTreeMap<InstanceKey, StreamCursor>,
    events: BTreeMap<InstanceKey, Vec<EventAppended>>,
    next_id: i64,
    // keyed by (instance, family, entity_key), ordered by insertion (== valid_from_seq order)
    versioned: BTreeMap<(InstanceKey, &'static str, String), Vec<VersionedRow>>,
    // keyed by (instance, family), ordered by event_seq
    ledgers: BTreeMap<(InstanceKey, &'static str), BTreeMap<u64, serde_json::Value>>,
}

/// An in-memory, single-process [`EventStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryStore {
    async fn configure_instance(&self, instance: Instance) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.instances.get(&instance.key) {
            if existing.genesis_tip != instance.genesis_tip {
                return Err(Error::AlreadyConfigured {
                    instance: instance.key,
                    existing: existing.genesis_tip,
                    requested: instance.genesis_tip,
                });
            }
            state.cursors.entry(instance.key).or_insert(StreamCursor {
                applied_through_seq: 0,
                tip: instance.genesis_tip,
            });
            return Ok(());
        }
        state.cursors.insert(
            instance.key,
            StreamCursor {
                applied_through_seq: 0,
                tip: instance.genesis_tip,
            },
        );
        state.instances.insert(instance.key, instance);
        Ok(())
    }

    async fn get_instance(&self, key: InstanceKey) -> Result<Option<Instance>> {
        Ok(self.state.lock().unwrap().instances.get(&key).copied())
    }

    async fn append_events(&self, rows: Vec<NewEvent>) -> Result<Vec<InstanceKey>> {
        let mut state = self.state.lock().unwrap();
        let mut touched = Vec::new();
        for row in rows {
            let id = state.next_id;
            state.next_id += 1;
            let event = EventAppended {
                id,
                instance: row.instance,
                event_seq: row.event_seq,
                prev_tip: row.prev_tip,
                new_tip: row.new_tip,
                event_signature: row.event_signature,
                abi_encoded_event_data: row.abi_encoded_event_data,
                event_type: row.event_type,
                args: row.args,
                block_number: row.block_number,
                block_timestamp: row.block_timestamp,
                block_hash: row.block_hash,
                tx_hash: row.tx_hash,
                log_index: row.log_index,
                canonical: true,
            };
            if !touched.contains(&row.instance) {
                touched.push(row.instance);
            }
            let bucket = state.events.entry(row.instance).or_default();
            if let Some(existing) = bucket
                .iter_mut()
                .find(|e| e.event_seq == event.event_seq)
            {
                *existing = event;
            } else {
                bucket.push(event);
                bucket.sort_by_key(|e| e.event_seq);
            }
        }
        Ok(touched)
    }

    async fn set_canonical(
        &self,
        instance: InstanceKey,
        range: SeqRange,
        canonical: bool,
    ) -> Result<Vec<u64>> {
        let mut state = self.state.lock().unwrap();
        let mut changed = Vec::new();
        if let Some(bucket) = state.events.get_mut(&instance) {
            for event in bucket.iter_mut() {
                if range.contains(event.event_seq) && event.canonical != canonical {
                    event.canonical = canonical;
                    changed.push(event.event_seq);
                }
            }
        }
        changed.sort_unstable();
        Ok(changed)
    }

    async fn begin(&self) -> Result<Box<dyn ProjectionTx>> {
        Ok(Box::new(MemoryTx {
            shared: self.state.clone(),
            local: State::default(),
            touched: HashSet::new(),
        }))
    }
}

/// A per-instance changeset over a [`MemoryStore`]. `local` only ever holds
/// data for instances in `touched`; `commit` replaces each touched
/// instance's slice of `shared` with `local`'s copy, leaving every other
/// instance's data exactly as another concurrently-open transaction left it.
struct MemoryTx {
    shared: Arc<Mutex<State>>,
    local: State,
    touched: HashSet<InstanceKey>,
}

fn versioned_key(instance: InstanceKey, family: &'static str, key: &str) -> (InstanceKey, &'static str, String) {
    (instance, family, key.to_string())
}

impl MemoryTx {
    /// Copy `instance`'s rows from `shared` into `local`, once. Every
    /// `ProjectionTx` method calls this first so `local` always reflects
    /// the latest committed state for any instance it reads or writes,
    /// without ever touching another instance's rows.
    fn ensure_loaded(&mut self, instance: InstanceKey) {
        if !self.touched.insert(instance) {
            return;
        }
        let shared = self.shared.lock().unwrap();
        if let Some(v) = shared.instances.get(&instance) {
            self.local.instances.insert(instance, *v);
        }
        if let Some(v) = shared.cursors.get(&instance) {
            self.local.cursors.insert(instance, *v);
        }
        if let Some(v) = shared.events.get(&instance) {
            self.local.events.insert(instance, v.clone());
        }
        for (k, v) in shared.versioned.iter().filter(|(k, _)| k.0 == instance) {
            self.local.versioned.insert(k.clone(), v.clone());
        }
        for (k, v) in shared.ledgers.iter().filter(|(k, _)| k.0 == instance) {
            self.local.ledgers.insert(k.clone(), v.clone());
        }
    }
}

#[async_trait::async_trait]
impl ProjectionTx for MemoryTx {
    async fn get_instance(&mut self, instance: InstanceKey) -> Result<Option<Instance>> {
        self.ensure_loaded(instance);
        Ok(self.local.instances.get(&instance).copied())
    }

    async fn load_cursor_for_update(&mut self, instance: InstanceKey) -> Result<Option<StreamCursor>> {
        self.ensure_loaded(instance);
        Ok(self.local.cursors.get(&instance).copied())
    }

    async fn save_cursor(&mut self, instance: InstanceKey, cursor: StreamCursor) -> Result<()> {
        self.ensure_loaded(instance);
        self.local.cursors.insert(instance, cursor);
        Ok(())
    }

    async fn get_canonical_event(
        &mut self,
        instance: InstanceKey,
        seq: u64,
    ) -> Result<Option<EventAppended>> {
        self.ensure_loaded(instance);
        Ok(self
            .local
            .events
            .get(&instance)
            .and_then(|bucket| bucket.iter().find(|e| e.event_seq == seq && e.canonical))
            .cloned())
    }

    async fn versioned_current(
        &mut self,
        instance: InstanceKey,
        family: &'static str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        self.ensure_loaded(instance);
        let k = versioned_key(instance, family, key);
        Ok(self
            .local
            .versioned
            .get(&k)
            .and_then(|rows| rows.iter().find(|r| r.valid_to_seq.is_none()))
            .map(|r| r.payload.clone()))
    }

    async fn versioned_close_and_insert(
        &mut self,
        instance: InstanceKey,
        family: &'static str,
        key: &str,
        event_seq: u64,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.ensure_loaded(instance);
        let k = versioned_key(instance, family, key);
        let rows = self.local.versioned.entry(k).or_default();
        if let Some(open) = rows.iter_mut().find(|r| r.valid_to_seq.is_none()) {
            open.valid_to_seq = Some(event_seq);
        }
        rows.push(VersionedRow {
            valid_from_seq: event_seq,
            valid_to_seq: None,
            payload,
        });
        Ok(())
    }

    async fn versioned_rollback(&mut self, instance: InstanceKey, rollback_seq: u64) -> Result<()> {
        self.ensure_loaded(instance);
        for ((inst, _family, _key), rows) in self.local.versioned.iter_mut() {
            if *inst != instance {
                continue;
            }
            rows.retain(|r| r.valid_from_seq < rollback_seq);
            for r in rows.iter_mut() {
                if let Some(to) = r.valid_to_seq {
                    if to >= rollback_seq {
                        r.valid_to_seq = None;
                    }
                }
            }
        }
        Ok(())
    }

    async fn ledger_append(
        &mut self,
        instance: InstanceKey,
        family: &'static str,
        event_seq: u64,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.ensure_loaded(instance);
        self.local
            .ledgers
            .entry((instance, family))
            .or_default()
            .insert(event_seq, payload);
        Ok(())
    }

    async fn ledger_rollback(&mut self, instance: InstanceKey, rollback_seq: u64) -> Result<()> {
        self.ensure_loaded(instance);
        for ((inst, _family), rows) in self.local.ledgers.iter_mut() {
            if *inst != instance {
                continue;
            }
            rows.retain(|seq, _| *seq < rollback_seq);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        for instance in &self.touched {
            match self.local.instances.get(instance) {
                Some(v) => {
                    shared.instances.insert(*instance, *v);
                }
                None => {
                    shared.instances.remove(instance);
                }
            }
            match self.local.cursors.get(instance) {
                Some(v) => {
                    shared.cursors.insert(*instance, *v);
                }
                None => {
                    shared.cursors.remove(instance);
                }
            }
            match self.local.events.get(instance) {
                Some(v) => {
                    shared.events.insert(*instance, v.clone());
                }
                None => {
                    shared.events.remove(instance);
                }
            }
            shared.versioned.retain(|(inst, _, _), _| inst != instance);
            for (k, v) in self.local.versioned.iter().filter(|(k, _)| &k.0 == instance) {
                shared.versioned.insert(k.clone(), v.clone());
            }
            shared.ledgers.retain(|(inst, _), _| inst != instance);
            for (k, v) in self.local.ledgers.iter().filter(|(k, _)| &k.0 == instance) {
                shared.ledgers.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }
}
