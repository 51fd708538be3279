//! Tron address rendering and intent hashing.
//!
//! Tron addresses are base58check over a `0x41`-prefixed 20-byte EVM
//! address.

use alloy_primitives::{Address, B256, keccak256};

const TRON_ADDRESS_PREFIX: u8 = 0x41;

/// Render `addr` as a base58check Tron address: `base58check(0x41 ||
/// addr)`, where the checksum is the first four bytes of
/// `sha256(sha256(0x41 || addr))`.
pub fn to_tron_base58(addr: Address) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(TRON_ADDRESS_PREFIX);
    payload.extend_from_slice(addr.as_slice());
    bs58::encode(payload).with_check().into_string()
}

/// `keccak256(abi.encode(forwarder, to_tron_evm))`: two left-padded
/// 32-byte address words concatenated then hashed.
pub fn intent_hash(forwarder: Address, to_tron_evm: Address) -> B256 {
    let mut buf = [0u8; 64];
    buf[12..32].copy_from_slice(forwarder.as_slice());
    buf[44..64].copy_from_slice(to_tron_evm.as_slice());
    keccak256(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_tron_base58_is_deterministic_and_checksummed() {
        let addr = Address::repeat_byte(0x11);
        let rendered = to_tron_base58(addr);
        assert_eq!(rendered, to_tron_base58(addr));
        // base58check decodes back to the same 21-byte payload.
        let decoded = bs58::decode(&rendered).with_check(Some(TRON_ADDRESS_PREFIX)).into_vec().unwrap();
        assert_eq!(decoded[0], TRON_ADDRESS_PREFIX);
        assert_eq!(&decoded[1..], addr.as_slice());
    }

    #[test]
    fn intent_hash_depends_on_both_addresses() {
        let a = Address::repeat_byte(0x01);
        let b = Address::repeat_byte(0x02);
        let c = Address::repeat_byte(0x03);
        assert_ne!(intent_hash(a, b), intent_hash(a, c));
        assert_ne!(intent_hash(a, b), intent_hash(b, a));
    }
}
