//! The single error surface the HTTP layer maps to status codes.

use anchorage_primitives::ByteCount;

/// Why an upload was rejected.
///
/// Every failure path of both state machines funnels into one of these;
/// compensation (refunds, quarantine, cache cleanup) has already run by the
/// time a value escapes the machine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    /// 413 (or 400 with an explanatory message on surfaces that prefer it).
    #[error("data item exceeds the {limit} byte limit")]
    TooLarge { limit: ByteCount },
    /// 400.
    #[error("unsupported content type `{got}`")]
    InvalidContentType { got: String },
    /// 400.
    #[error("invalid data item: {reason}")]
    InvalidDataItem { reason: String },
    /// 400.
    #[error("invalid chunk: {reason}")]
    InvalidChunk { reason: String },
    /// 402.
    #[error("insufficient balance")]
    InsufficientBalance,
    /// 402; a paid-by approval was missing, denied, or unreachable.
    #[error("paid-by approval failed")]
    ApprovalFailed,
    /// 503; compensation could not revoke a consumed paid-by approval.
    #[error("paid-by revocation failed")]
    RevokeFailed,
    /// 403.
    #[error("address is blocklisted")]
    Blocklisted,
    /// 403.
    #[error("upload matches a spam pattern")]
    SpamPattern,
    /// 202 with the existing id; the concurrent winner emits the receipt.
    #[error("data item is already being uploaded")]
    DataItemExists,
    /// 404.
    #[error("unknown upload")]
    NotFound,
    /// 503; the client may retry, any reservation has been refunded.
    #[error("service unavailable: {reason}")]
    ServiceUnavailable { reason: String },
}

impl UploadError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::TooLarge { .. } => 413,
            Self::InvalidContentType { .. }
            | Self::InvalidDataItem { .. }
            | Self::InvalidChunk { .. } => 400,
            Self::InsufficientBalance | Self::ApprovalFailed => 402,
            Self::Blocklisted | Self::SpamPattern => 403,
            Self::DataItemExists => 202,
            Self::NotFound => 404,
            Self::RevokeFailed | Self::ServiceUnavailable { .. } => 503,
        }
    }

    pub(crate) fn unavailable(reason: impl std::fmt::Display) -> Self {
        Self::ServiceUnavailable {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid(reason: impl std::fmt::Display) -> Self {
        Self::InvalidDataItem {
            reason: reason.to_string(),
        }
    }
}
