//! Deep hashing, data-item signature verification and receipt signing.

pub mod deep_hash;
pub mod receipt;
pub mod verify;
pub mod wallet;

pub use deep_hash::{DeepHashChunk, DeepHashDigest, StreamedBlob, deep_hash};
pub use receipt::{
    legacy_receipt_signing_payload, receipt_signing_payload, sign_receipt, verify_receipt,
};
pub use verify::{data_item_signing_payload, verify_data_item, verify_data_item_blocking};
pub use wallet::{Wallet, WalletError, WalletJwk};
