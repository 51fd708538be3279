//! Minimal ABI declarations for the on-chain index contracts' shared
//! `EventAppended` event. Both `UntronIntentsIndex` and
//! `IntentsForwarderIndex` emit the same signature; declaring it directly
//! here (instead of through a separate bindings crate) keeps this binary's
//! dependency footprint to what it actually decodes.

use alloy::sol;

sol! {
    interface UntronIntentsIndex {
        event EventAppended(
            uint256 eventSeq,
            bytes32 prevTip,
            bytes32 newTip,
            bytes32 eventSignature,
            bytes abiEncodedEventData
        );
    }
}

sol! {
    interface IntentsForwarderIndex {
        event EventAppended(
            uint256 eventSeq,
            bytes32 prevTip,
            bytes32 newTip,
            bytes32 eventSignature,
            bytes abiEncodedEventData
        );
    }
}
