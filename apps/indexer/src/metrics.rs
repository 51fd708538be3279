//! Per-instance telemetry. One `StreamTelemetry` is built per configured
//! instance and carries its `(stream, chain_id)` as constant attributes on
//! every recorded point, so counters/histograms from different instances
//! stay distinguishable in the same meter.

use crate::config::Stream;
use opentelemetry::metrics::{Counter, Gauge, Histogram};
use opentelemetry::KeyValue;

pub struct StreamTelemetry {
    attrs: Vec<KeyValue>,

    rpc_errors: Counter<u64>,
    rpc_latency_ms: Histogram<u64>,

    chain_head: Gauge<u64>,
    chain_safe_head: Gauge<u64>,
    chain_next_block: Gauge<u64>,
    chain_chunk_blocks: Gauge<u64>,
    reorgs: Counter<u64>,

    range_logs: Histogram<u64>,
    range_latency_ms: Histogram<u64>,

    db_errors: Counter<u64>,
    db_latency_ms: Histogram<u64>,
    rows_upserted: Counter<u64>,

    timestamp_enrichment_ms: Histogram<u64>,
}

impl StreamTelemetry {
    pub fn new(stream: Stream, chain_id: u64) -> Self {
        let meter = opentelemetry::global::meter("untron-indexer");
        let attrs = vec![
            KeyValue::new("stream", stream.as_str()),
            KeyValue::new("chain_id", chain_id as i64),
        ];

        Self {
            attrs,
            rpc_errors: meter.u64_counter("indexer.rpc.errors").build(),
            rpc_latency_ms: meter.u64_histogram("indexer.rpc.latency_ms").build(),
            chain_head: meter.u64_gauge("indexer.chain.head").build(),
            chain_safe_head: meter.u64_gauge("indexer.chain.safe_head").build(),
            chain_next_block: meter.u64_gauge("indexer.chain.next_block").build(),
            chain_chunk_blocks: meter.u64_gauge("indexer.chain.chunk_blocks").build(),
            reorgs: meter.u64_counter("indexer.reorgs").build(),
            range_logs: meter.u64_histogram("indexer.range.logs").build(),
            range_latency_ms: meter.u64_histogram("indexer.range.latency_ms").build(),
            db_errors: meter.u64_counter("indexer.db.errors").build(),
            db_latency_ms: meter.u64_histogram("indexer.db.latency_ms").build(),
            rows_upserted: meter.u64_counter("indexer.db.rows_upserted").build(),
            timestamp_enrichment_ms: meter
                .u64_histogram("indexer.timestamp_enrichment.latency_ms")
                .build(),
        }
    }

    fn attrs_with(&self, extra: KeyValue) -> Vec<KeyValue> {
        let mut out = self.attrs.clone();
        out.push(extra);
        out
    }

    pub fn rpc_error(&self, method: &str) {
        self.rpc_errors
            .add(1, &self.attrs_with(KeyValue::new("method", method.to_string())));
    }

    pub fn observe_rpc_latency_ms(&self, method: &str, ms: u64) {
        self.rpc_latency_ms
            .record(ms, &self.attrs_with(KeyValue::new("method", method.to_string())));
    }

    pub fn set_chain_position(&self, head: u64, safe_head: u64, next_block: u64, chunk_blocks: u64) {
        self.chain_head.record(head, &self.attrs);
        self.chain_safe_head.record(safe_head, &self.attrs);
        self.chain_next_block.record(next_block, &self.attrs);
        self.chain_chunk_blocks.record(chunk_blocks, &self.attrs);
    }

    pub fn reorg_detected(&self) {
        self.reorgs.add(1, &self.attrs);
    }

    /// `errors` is currently always 0 at the call site; kept so a future
    /// retry-within-range path has somewhere to report to.
    pub fn observe_range(&self, from_block: u64, to_block: u64, logs: u64, errors: u64, total_ms: u64) {
        let range_blocks = to_block.saturating_sub(from_block).saturating_add(1);
        let span = self.attrs_with(KeyValue::new("range_blocks", range_blocks as i64));
        if errors > 0 {
            self.rpc_errors.add(errors, &span);
        }
        self.range_logs.record(logs, &self.attrs);
        self.range_latency_ms.record(total_ms, &self.attrs);
    }

    pub fn db_error(&self, op: &str) {
        self.db_errors
            .add(1, &self.attrs_with(KeyValue::new("op", op.to_string())));
    }

    pub fn observe_db_latency_ms(&self, op: &str, ms: u64) {
        self.db_latency_ms
            .record(ms, &self.attrs_with(KeyValue::new("op", op.to_string())));
    }

    pub fn rows_upserted(&self, table: &str, rows: u64) {
        self.rows_upserted
            .add(rows, &self.attrs_with(KeyValue::new("table", table.to_string())));
    }

    pub fn observe_timestamp_enrichment_ms(&self, ms: u64) {
        self.timestamp_enrichment_ms.record(ms, &self.attrs);
    }
}
