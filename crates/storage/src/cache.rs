//! Bounded in-memory payload cache.

use std::sync::Arc;

use anchorage_primitives::{ByteCount, DataItemId};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::sink::{ByteSink, SinkError, SinkReport};

/// Byte-weighted cache of recently uploaded small items.
///
/// A read-side accelerator only; it is never the sink that satisfies the
/// at-least-one-durable rule.
#[derive(Clone)]
pub struct PayloadCache {
    inner: moka::sync::Cache<DataItemId, Bytes>,
}

impl std::fmt::Debug for PayloadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl PayloadCache {
    pub fn new(max_bytes: u64) -> Self {
        let inner = moka::sync::Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_, value: &Bytes| value.len().try_into().unwrap_or(u32::MAX))
            .build();
        Self { inner }
    }

    pub fn insert(&self, id: DataItemId, bytes: Bytes) {
        self.inner.insert(id, bytes);
    }

    pub fn get(&self, id: &DataItemId) -> Option<Bytes> {
        self.inner.get(id)
    }

    pub fn invalidate(&self, id: &DataItemId) {
        self.inner.invalidate(id);
    }
}

/// Fan-out sink feeding [`PayloadCache`].
pub struct CacheSink {
    cache: PayloadCache,
    id: DataItemId,
    limit: usize,
    buffer: BytesMut,
}

impl CacheSink {
    pub fn new(cache: PayloadCache, id: DataItemId, limit: usize) -> Self {
        Self {
            cache,
            id,
            limit,
            buffer: BytesMut::new(),
        }
    }
}

#[async_trait]
impl ByteSink for CacheSink {
    fn label(&self) -> &'static str {
        "cache"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if self.buffer.len() + chunk.len() > self.limit {
            return Err(SinkError::Cache {
                message: format!("item exceeds the {}-byte cache limit", self.limit),
            });
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<SinkReport, SinkError> {
        let this = *self;
        let bytes_written = this.buffer.len() as u64;
        this.cache.insert(this.id, this.buffer.freeze());
        Ok(SinkReport {
            label: "cache",
            bytes_written: ByteCount(bytes_written),
            etag: None,
        })
    }

    async fn abort(self: Box<Self>) {}
}

/// Shared handle type used when wiring sinks.
pub type SharedPayloadCache = Arc<PayloadCache>;
