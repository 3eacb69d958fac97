//! Parser error kinds.

use anchorage_primitives::SignatureTypeError;

/// Why parsing stopped.
///
/// Cloneable so the sticky copy kept by the parser and the copy sent down
/// the event channel are the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    UnsupportedSignatureType(#[from] SignatureTypeError),
    #[error("invalid presence byte {value:#04x} (expected 0 or 1)")]
    InvalidPresenceByte { value: u8 },
    #[error("declared tag blob of {declared} bytes exceeds the {max}-byte cap")]
    TagsTooLarge { declared: u64, max: u64 },
    #[error("stream ended inside the {field} field")]
    TruncatedHeader { field: &'static str },
    #[error("inbound stream failed: {message}")]
    Source { message: String },
}

impl ParseError {
    /// True when the client sent bad bytes (as opposed to the transport
    /// failing underneath them).
    pub fn is_client_fault(&self) -> bool {
        !matches!(self, Self::Source { .. })
    }
}
