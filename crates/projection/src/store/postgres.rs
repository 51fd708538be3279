//! Postgres-backed [`EventStore`] implementation.
//!
//! Shares the ingester's connection setup (`PgConnectOptions` with
//! slow-statement logging), bulk-insert-with-upsert style via
//! `QueryBuilder`, and table/column/domain names (`chain.instance`,
//! `chain.stream_cursor`, `chain.event_appended`,
//! `evm_address`/`bytes32_hex`/`bytes_hex`/`txhash_hex`).

use super::{EventStore, ProjectionTx, SeqRange};
use crate::error::{Error, Result};
use crate::ids::{InstanceKey, Stream};
use crate::model::{Args, EventAppended, Instance, NewEvent, StreamCursor};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use sqlx::{
    ConnectOptions, PgPool, Postgres, QueryBuilder, Row, Transaction,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::str::FromStr;
use std::time::Duration;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(Box::new(err))
    }
}

fn addr_hex(a: Address) -> String {
    format!("0x{}", hex::encode(a.as_slice()))
}

fn b256_hex(b: B256) -> String {
    format!("0x{}", hex::encode(b.as_slice()))
}

fn bytes_hex(b: &[u8]) -> String {
    format!("0x{}", hex::encode(b))
}

fn parse_addr(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| Error::Store(Box::new(e)))
}

fn parse_b256(s: &str) -> Result<B256> {
    B256::from_str(s).map_err(|e| Error::Store(Box::new(e)))
}

fn parse_bytes(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| Error::Store(Box::new(e)))
}

fn chain_id_db(chain_id: u64) -> Result<i64> {
    i64::try_from(chain_id).map_err(|e| Error::Store(Box::new(e)))
}

/// A Postgres-backed [`EventStore`], one pool shared across all instances.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to `database_url`, matching `apps/indexer/src/db.rs::Db::connect`:
    /// slow statements above 200ms are logged at `warn`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let opts = PgConnectOptions::from_str(database_url)
            .map_err(|e| Error::Store(Box::new(e)))?
            .log_statements(tracing::log::LevelFilter::Trace)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_millis(200));

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an already-constructed pool (used by tests with a pool built
    /// from `DATABASE_URL` outside this crate).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn instance_row_id(
        executor: impl sqlx::PgExecutor<'_>,
        instance: InstanceKey,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "select id from chain.instance \
             where stream = $1::chain.stream and chain_id = $2 and contract_address = $3::evm_address",
        )
        .bind(instance.stream.as_str())
        .bind(chain_id_db(instance.chain_id)?)
        .bind(addr_hex(instance.contract_address))
        .fetch_optional(executor)
        .await?;
        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    fn decode_event_row(row: &sqlx::postgres::PgRow) -> Result<EventAppended> {
        let stream: String = row.try_get("stream")?;
        let stream = match stream.as_str() {
            "pool" => Stream::Pool,
            "forwarder" => Stream::Forwarder,
            other => {
                return Err(Error::Store(
                    format!("unknown chain.stream value: {other}").into(),
                ));
            }
        };
        let chain_id: i64 = row.try_get("chain_id")?;
        let contract_address: String = row.try_get("contract_address")?;
        let instance = InstanceKey::new(
            stream,
            u64::try_from(chain_id).map_err(|e| Error::Store(Box::new(e)))?,
            parse_addr(&contract_address)?,
        );

        let args_json: serde_json::Value = row.try_get("args")?;
        let args: Args =
            serde_json::from_value(args_json).map_err(|e| Error::Store(Box::new(e)))?;

        let event_seq: i64 = row.try_get("event_seq")?;
        let block_number: i64 = row.try_get("block_number")?;
        let block_timestamp: i64 = row.try_get("block_timestamp")?;
        let log_index: i32 = row.try_get("log_index")?;

        Ok(EventAppended {
            id: row.try_get("id")?,
            instance,
            event_seq: u64::try_from(event_seq).map_err(|e| Error::Store(Box::new(e)))?,
            prev_tip: parse_b256(&row.try_get::<String, _>("prev_tip")?)?,
            new_tip: parse_b256(&row.try_get::<String, _>("new_tip")?)?,
            event_signature: parse_b256(&row.try_get::<String, _>("event_signature")?)?,
            abi_encoded_event_data: parse_bytes(
                &row.try_get::<String, _>("abi_encoded_event_data")?,
            )?,
            event_type: row.try_get("event_type")?,
            args,
            block_number: u64::try_from(block_number).map_err(|e| Error::Store(Box::new(e)))?,
            block_timestamp: u64::try_from(block_timestamp)
                .map_err(|e| Error::Store(Box::new(e)))?,
            block_hash: parse_b256(&row.try_get::<String, _>("block_hash")?)?,
            tx_hash: parse_b256(&row.try_get::<String, _>("tx_hash")?)?,
            log_index: u32::try_from(log_index).map_err(|e| Error::Store(Box::new(e)))?,
            canonical: row.try_get("canonical")?,
        })
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn configure_instance(&self, instance: Instance) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query_scalar(
            "select genesis_tip::text from chain.instance \
             where stream = $1::chain.stream and chain_id = $2 and contract_address = $3::evm_address",
        )
        .bind(instance.key.stream.as_str())
        .bind(chain_id_db(instance.key.chain_id)?)
        .bind(addr_hex(instance.key.contract_address))
        .fetch_optional(&mut *tx)
        .await?;

        let genesis_hex = b256_hex(instance.genesis_tip);

        if let Some(existing_hex) = existing {
            if existing_hex != genesis_hex {
                return Err(Error::AlreadyConfigured {
                    instance: instance.key,
                    existing: parse_b256(&existing_hex)?,
                    requested: instance.genesis_tip,
                });
            }
        } else {
            sqlx::query(
                "insert into chain.instance (stream, chain_id, contract_address, genesis_tip) \
                 values ($1::chain.stream, $2, $3::evm_address, $4::bytes32_hex)",
            )
            .bind(instance.key.stream.as_str())
            .bind(chain_id_db(instance.key.chain_id)?)
            .bind(addr_hex(instance.key.contract_address))
            .bind(&genesis_hex)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "insert into chain.stream_cursor (stream, chain_id, contract_address, applied_through_seq, tip) \
             values ($1::chain.stream, $2, $3::evm_address, 0, $4::bytes32_hex) \
             on conflict (stream, chain_id, contract_address) do nothing",
        )
        .bind(instance.key.stream.as_str())
        .bind(chain_id_db(instance.key.chain_id)?)
        .bind(addr_hex(instance.key.contract_address))
        .bind(&genesis_hex)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_instance(&self, key: InstanceKey) -> Result<Option<Instance>> {
        let row: Option<String> = sqlx::query_scalar(
            "select genesis_tip::text from chain.instance \
             where stream = $1::chain.stream and chain_id = $2 and contract_address = $3::evm_address",
        )
        .bind(key.stream.as_str())
        .bind(chain_id_db(key.chain_id)?)
        .bind(addr_hex(key.contract_address))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|hex| {
            Ok(Instance {
                key,
                genesis_tip: parse_b256(&hex)?,
            })
        })
        .transpose()
    }

    async fn append_events(&self, rows: Vec<NewEvent>) -> Result<Vec<InstanceKey>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut touched = Vec::new();
        for row in &rows {
            if !touched.contains(&row.instance) {
                touched.push(row.instance);
            }
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "insert into chain.event_appended (\
             stream, chain_id, contract_address, \
             block_number, block_timestamp, block_hash, \
             tx_hash, log_index, canonical, \
             event_seq, prev_tip, new_tip, event_signature, abi_encoded_event_data, \
             event_type, args\
             ) ",
        );

        qb.push_values(&rows, |mut b, row| {
            b.push_bind(row.instance.stream.as_str())
                .push_unseparated("::chain.stream");
            b.push_bind(chain_id_db(row.instance.chain_id).unwrap_or_default());
            b.push_bind(addr_hex(row.instance.contract_address))
                .push_unseparated("::evm_address");

            b.push_bind(row.block_number as i64);
            b.push_bind(row.block_timestamp as i64);
            b.push_bind(b256_hex(row.block_hash))
                .push_unseparated("::bytes32_hex");

            b.push_bind(b256_hex(row.tx_hash))
                .push_unseparated("::txhash_hex");
            b.push_bind(row.log_index as i32);
            b.push_bind(true);

            b.push_bind(row.event_seq as i64);
            b.push_bind(b256_hex(row.prev_tip))
                .push_unseparated("::bytes32_hex");
            b.push_bind(b256_hex(row.new_tip))
                .push_unseparated("::bytes32_hex");
            b.push_bind(b256_hex(row.event_signature))
                .push_unseparated("::bytes32_hex");
            b.push_bind(bytes_hex(&row.abi_encoded_event_data))
                .push_unseparated("::bytes_hex");

            b.push_bind(row.event_type.clone());
            b.push_bind(serde_json::to_value(&row.args).unwrap_or(serde_json::Value::Null));
        });

        qb.push(
            " on conflict (chain_id, tx_hash, log_index) do update set \
              stream = excluded.stream, \
              contract_address = excluded.contract_address, \
              block_number = excluded.block_number, \
              block_timestamp = excluded.block_timestamp, \
              block_hash = excluded.block_hash, \
              canonical = excluded.canonical, \
              event_seq = excluded.event_seq, \
              prev_tip = excluded.prev_tip, \
              new_tip = excluded.new_tip, \
              event_signature = excluded.event_signature, \
              abi_encoded_event_data = excluded.abi_encoded_event_data, \
              event_type = excluded.event_type, \
              args = excluded.args",
        );

        qb.build().execute(&self.pool).await?;

        Ok(touched)
    }

    async fn set_canonical(
        &self,
        instance: InstanceKey,
        range: SeqRange,
        canonical: bool,
    ) -> Result<Vec<u64>> {
        let to_seq = range.to_seq.map(|v| v as i64).unwrap_or(i64::MAX);
        let rows: Vec<(i64,)> = sqlx::query_as(
            "update chain.event_appended set canonical = $1 \
             where stream = $2::chain.stream and chain_id = $3 and contract_address = $4::evm_address \
               and event_seq >= $5 and event_seq <= $6 and canonical <> $1 \
             returning event_seq",
        )
        .bind(canonical)
        .bind(instance.stream.as_str())
        .bind(chain_id_db(instance.chain_id)?)
        .bind(addr_hex(instance.contract_address))
        .bind(range.from_seq as i64)
        .bind(to_seq)
        .fetch_all(&self.pool)
        .await?;

        let mut seqs: Vec<u64> = rows
            .into_iter()
            .map(|(s,)| u64::try_from(s).unwrap_or_default())
            .collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn begin(&self) -> Result<Box<dyn ProjectionTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTx { tx }))
    }
}

struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ProjectionTx for PostgresTx {
    async fn get_instance(&mut self, instance: InstanceKey) -> Result<Option<Instance>> {
        let row: Option<String> = sqlx::query_scalar(
            "select genesis_tip::text from chain.instance \
             where stream = $1::chain.stream and chain_id = $2 and contract_address = $3::evm_address",
        )
        .bind(instance.stream.as_str())
        .bind(chain_id_db(instance.chain_id)?)
        .bind(addr_hex(instance.contract_address))
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|hex| {
            Ok(Instance {
                key: instance,
                genesis_tip: parse_b256(&hex)?,
            })
        })
        .transpose()
    }

    async fn load_cursor_for_update(&mut self, instance: InstanceKey) -> Result<Option<StreamCursor>> {
        let row = sqlx::query(
            "select applied_through_seq, tip::text as tip from chain.stream_cursor \
             where stream = $1::chain.stream and chain_id = $2 and contract_address = $3::evm_address \
             for update",
        )
        .bind(instance.stream.as_str())
        .bind(chain_id_db(instance.chain_id)?)
        .bind(addr_hex(instance.contract_address))
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let applied_through_seq: i64 = row.try_get("applied_through_seq")?;
        let tip: String = row.try_get("tip")?;
        Ok(Some(StreamCursor {
            applied_through_seq: u64::try_from(applied_through_seq)
                .map_err(|e| Error::Store(Box::new(e)))?,
            tip: parse_b256(&tip)?,
        }))
    }

    async fn save_cursor(&mut self, instance: InstanceKey, cursor: StreamCursor) -> Result<()> {
        sqlx::query(
            "update chain.stream_cursor set applied_through_seq = $1, tip = $2::bytes32_hex, updated_at = now() \
             where stream = $3::chain.stream and chain_id = $4 and contract_address = $5::evm_address",
        )
        .bind(cursor.applied_through_seq as i64)
        .bind(b256_hex(cursor.tip))
        .bind(instance.stream.as_str())
        .bind(chain_id_db(instance.chain_id)?)
        .bind(addr_hex(instance.contract_address))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_canonical_event(
        &mut self,
        instance: InstanceKey,
        seq: u64,
    ) -> Result<Option<EventAppended>> {
        let row = sqlx::query(
            "select id, stream, chain_id, contract_address, \
                    block_number, block_timestamp, block_hash::text as block_hash, \
                    tx_hash::text as tx_hash, log_index, canonical, \
                    event_seq, prev_tip::text as prev_tip, new_tip::text as new_tip, \
                    event_signature::text as event_signature, \
                    abi_encoded_event_data::text as abi_encoded_event_data, \
                    event_type, args \
             from chain.event_appended \
             where stream = $1::chain.stream and chain_id = $2 and contract_address = $3::evm_address \
               and event_seq = $4 and canonical",
        )
        .bind(instance.stream.as_str())
        .bind(chain_id_db(instance.chain_id)?)
        .bind(addr_hex(instance.contract_address))
        .bind(seq as i64)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(|r| PostgresStore::decode_event_row(&r)).transpose()
    }

    async fn versioned_current(
        &mut self,
        instance: InstanceKey,
        family: &'static str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let Some(instance_id) = PostgresStore::instance_row_id(&mut *self.tx, instance).await?
        else {
            return Ok(None);
        };
        let payload: Option<serde_json::Value> = sqlx::query_scalar(
            "select payload from projection.versioned_row \
             where instance_id = $1 and family = $2 and entity_key = $3 and valid_to_seq is null",
        )
        .bind(instance_id)
        .bind(family)
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(payload)
    }

    async fn versioned_close_and_insert(
        &mut self,
        instance: InstanceKey,
        family: &'static str,
        key: &str,
        event_seq: u64,
        payload: serde_json::Value,
    ) -> Result<()> {
        let instance_id = PostgresStore::instance_row_id(&mut *self.tx, instance)
            .await?
            .ok_or(Error::NotConfigured(instance))?;

        sqlx::query(
            "update projection.versioned_row set valid_to_seq = $1 \
             where instance_id = $2 and family = $3 and entity_key = $4 and valid_to_seq is null",
        )
        .bind(event_seq as i64)
        .bind(instance_id)
        .bind(family)
        .bind(key)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            "insert into projection.versioned_row (instance_id, family, entity_key, valid_from_seq, valid_to_seq, payload) \
             values ($1, $2, $3, $4, null, $5)",
        )
        .bind(instance_id)
        .bind(family)
        .bind(key)
        .bind(event_seq as i64)
        .bind(payload)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn versioned_rollback(&mut self, instance: InstanceKey, rollback_seq: u64) -> Result<()> {
        let Some(instance_id) = PostgresStore::instance_row_id(&mut *self.tx, instance).await?
        else {
            return Ok(());
        };

        sqlx::query("delete from projection.versioned_row where instance_id = $1 and valid_from_seq >= $2")
            .bind(instance_id)
            .bind(rollback_seq as i64)
            .execute(&mut *self.tx)
            .await?;

        sqlx::query(
            "update projection.versioned_row set valid_to_seq = null \
             where instance_id = $1 and valid_to_seq >= $2",
        )
        .bind(instance_id)
        .bind(rollback_seq as i64)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn ledger_append(
        &mut self,
        instance: InstanceKey,
        family: &'static str,
        event_seq: u64,
        payload: serde_json::Value,
    ) -> Result<()> {
        let instance_id = PostgresStore::instance_row_id(&mut *self.tx, instance)
            .await?
            .ok_or(Error::NotConfigured(instance))?;

        sqlx::query(
            "insert into projection.ledger_row (instance_id, family, event_seq, payload) \
             values ($1, $2, $3, $4) \
             on conflict (instance_id, family, event_seq) do update set payload = excluded.payload",
        )
        .bind(instance_id)
        .bind(family)
        .bind(event_seq as i64)
        .bind(payload)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn ledger_rollback(&mut self, instance: InstanceKey, rollback_seq: u64) -> Result<()> {
        let Some(instance_id) = PostgresStore::instance_row_id(&mut *self.tx, instance).await?
        else {
            return Ok(());
        };
        sqlx::query("delete from projection.ledger_row where instance_id = $1 and event_seq >= $2")
            .bind(instance_id)
            .bind(rollback_seq as i64)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
