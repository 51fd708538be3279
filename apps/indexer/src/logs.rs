//! Validates and orders a raw `eth_getLogs` batch before decoding.
//!
//! RPC providers don't guarantee log ordering within a response, and a
//! `removed: true` log means the provider's view reorged mid-query; both
//! are rejected here rather than silently fed to the decoder.

use alloy::primitives::B256;
use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ValidatedLog {
    pub log: alloy::rpc::types::Log,
    pub block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub log_index: u64,
}

pub fn validate_and_sort_logs(raw_logs: Vec<alloy::rpc::types::Log>) -> Result<Vec<ValidatedLog>> {
    let mut out = Vec::with_capacity(raw_logs.len());
    for log in raw_logs {
        if log.removed {
            anyhow::bail!("eth_getLogs returned a removed log (reorg mid-query)");
        }
        let block_number = log.block_number.context("log missing block_number")?;
        let block_hash = log.block_hash.context("log missing block_hash")?;
        let tx_hash = log.transaction_hash.context("log missing transaction_hash")?;
        let log_index = log.log_index.context("log missing log_index")?;

        out.push(ValidatedLog {
            log,
            block_number,
            block_hash,
            tx_hash,
            log_index,
        });
    }

    out.sort_by_key(|l| (l.block_number, l.log_index));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_removed_logs() {
        let mut log = alloy::rpc::types::Log::default();
        log.removed = true;
        log.block_number = Some(1);
        log.block_hash = Some(B256::ZERO);
        log.transaction_hash = Some(B256::ZERO);
        log.log_index = Some(0);
        assert!(validate_and_sort_logs(vec![log]).is_err());
    }

    #[test]
    fn sorts_by_block_then_log_index() {
        let make = |block: u64, idx: u64| {
            let mut log = alloy::rpc::types::Log::default();
            log.block_number = Some(block);
            log.block_hash = Some(B256::ZERO);
            log.transaction_hash = Some(B256::ZERO);
            log.log_index = Some(idx);
            log
        };
        let logs = vec![make(2, 1), make(1, 5), make(1, 0)];
        let sorted = validate_and_sort_logs(logs).unwrap();
        let keys: Vec<(u64, u64)> = sorted.iter().map(|l| (l.block_number, l.log_index)).collect();
        assert_eq!(keys, vec![(1, 0), (1, 5), (2, 1)]);
    }
}
