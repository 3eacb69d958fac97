//! Shared wire-envelope types for the anchorage upload pipeline.
//!
//! A *data item* is a signed, tagged binary record. Everything that needs to
//! agree on its byte layout — the streaming parser, the verifiers, the
//! storage sinks and the upload state machines — agrees through the types in
//! this crate.

pub mod address;
pub mod header;
pub mod id;
pub mod receipt;
pub mod signature;
pub mod tags;
pub mod units;
pub mod upload;

pub use address::NativeAddress;
pub use header::DataItemHeader;
pub use id::DataItemId;
pub use receipt::{RECEIPT_VERSION, Receipt, SignedReceipt};
pub use signature::{SignatureConfig, SignatureType, SignatureTypeError};
pub use tags::{Tag, TagCodecError, decode_tags, encode_tags};
pub use units::{ByteCount, Winston};
pub use upload::{InFlightUpload, MultipartFailure, MultipartUpload, PremiumFeatureType};

/// Hard cap on the encoded tag blob, in bytes.
///
/// Anything larger is rejected during header parsing before any payload byte
/// is looked at.
pub const MAX_TAG_BYTES: u64 = 4096;

/// Presence flag preceding the optional target and anchor fields.
pub const FIELD_ABSENT: u8 = 0;
/// See [`FIELD_ABSENT`]; a present field is followed by exactly 32 bytes.
pub const FIELD_PRESENT: u8 = 1;
