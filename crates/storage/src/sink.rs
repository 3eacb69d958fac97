//! The sink seam of the fan-out.

use anchorage_primitives::ByteCount;
use async_trait::async_trait;
use bytes::Bytes;

/// Why a sink gave up.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("object store: {message}")]
    ObjectStore { message: String },
    #[error("filesystem backup: {message}")]
    Fs { message: String },
    #[error("inline kv: {message}")]
    Kv { message: String },
    #[error("cache: {message}")]
    Cache { message: String },
    #[error("circuit open for {target}")]
    CircuitOpen { target: &'static str },
    #[error("source failed: {message}")]
    Source { message: String },
}

/// What a finished sink reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub label: &'static str,
    pub bytes_written: ByteCount,
    /// Object-store etag, when the sink produced one.
    pub etag: Option<String>,
}

/// One consumer of the teed upload stream.
///
/// A sink receives every chunk in order, then exactly one of `finish`
/// (commit) or `abort` (clean up). Durable sinks satisfy the
/// at-least-one-durable enlistment rule; the in-memory cache does not.
#[async_trait]
pub trait ByteSink: Send {
    fn label(&self) -> &'static str;

    /// Whether this sink counts as durable storage.
    fn is_durable(&self) -> bool;

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError>;

    /// Commits the sink's artifact.
    async fn finish(self: Box<Self>) -> Result<SinkReport, SinkError>;

    /// Destroys any partial artifact. Best effort; never fails the caller.
    async fn abort(self: Box<Self>);
}
