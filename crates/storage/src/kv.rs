//! Inline key/value rows for small items.
//!
//! Items at or below the inline threshold also land as a single DynamoDB
//! row holding the gzip-compressed raw item, which lets the read path skip
//! the object store entirely. The row is a cache: quarantine deletes it and
//! leaves forensics to the filesystem and object-store artifacts.

use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::sync::Arc;

use anchorage_primitives::{ByteCount, DataItemId};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use bytes::{Bytes, BytesMut};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use parking_lot::Mutex;

use crate::{
    breaker::{BreakerError, CircuitBreaker},
    sink::{ByteSink, SinkError, SinkReport},
};

#[derive(Debug, Clone, thiserror::Error)]
#[error("kv store: {message}")]
pub struct KvError {
    pub message: String,
}

impl KvError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<KvError> for SinkError {
    fn from(error: KvError) -> Self {
        Self::Kv {
            message: error.message,
        }
    }
}

/// One inline row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineRow {
    pub content_type: String,
    pub payload_data_start: ByteCount,
    /// gzip of the complete raw item.
    pub gzipped_item: Bytes,
}

/// The row-store seam.
#[async_trait]
pub trait KvRows: Send + Sync {
    async fn put_inline(&self, id: &DataItemId, row: InlineRow) -> Result<(), KvError>;
    async fn get_inline(&self, id: &DataItemId) -> Result<Option<InlineRow>, KvError>;
    async fn delete_inline(&self, id: &DataItemId) -> Result<(), KvError>;
}

/// DynamoDB-backed rows.
#[derive(Debug, Clone)]
pub struct DynamoDbKvRows {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoDbKvRows {
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

fn ddb_error<E: std::fmt::Debug>(error: E) -> KvError {
    KvError::new(format!("{error:?}"))
}

#[async_trait]
impl KvRows for DynamoDbKvRows {
    async fn put_inline(&self, id: &DataItemId, row: InlineRow) -> Result<(), KvError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("DataItemId", AttributeValue::S(id.to_string()))
            .item("ContentType", AttributeValue::S(row.content_type))
            .item(
                "PayloadDataStart",
                AttributeValue::N(row.payload_data_start.to_string()),
            )
            .item(
                "GzippedItem",
                AttributeValue::B(aws_sdk_dynamodb::primitives::Blob::new(
                    row.gzipped_item.to_vec(),
                )),
            )
            .send()
            .await
            .map_err(ddb_error)?;
        Ok(())
    }

    async fn get_inline(&self, id: &DataItemId) -> Result<Option<InlineRow>, KvError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("DataItemId", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(ddb_error)?;
        let Some(item) = output.item else {
            return Ok(None);
        };
        let content_type = item
            .get("ContentType")
            .and_then(|v| v.as_s().ok())
            .cloned()
            .ok_or_else(|| KvError::new("row missing ContentType"))?;
        let payload_data_start = item
            .get("PayloadDataStart")
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| KvError::new("row missing PayloadDataStart"))?;
        let gzipped_item = item
            .get("GzippedItem")
            .and_then(|v| v.as_b().ok())
            .map(|blob| Bytes::copy_from_slice(blob.as_ref()))
            .ok_or_else(|| KvError::new("row missing GzippedItem"))?;
        Ok(Some(InlineRow {
            content_type,
            payload_data_start: ByteCount(payload_data_start),
            gzipped_item,
        }))
    }

    async fn delete_inline(&self, id: &DataItemId) -> Result<(), KvError> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("DataItemId", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(ddb_error)?;
        Ok(())
    }
}

/// Test double.
#[derive(Debug, Default)]
pub struct InMemoryKvRows {
    rows: Mutex<HashMap<String, InlineRow>>,
    fail_puts: Mutex<bool>,
}

impl InMemoryKvRows {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_puts(&self, fail: bool) {
        *self.fail_puts.lock() = fail;
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }
}

#[async_trait]
impl KvRows for InMemoryKvRows {
    async fn put_inline(&self, id: &DataItemId, row: InlineRow) -> Result<(), KvError> {
        if *self.fail_puts.lock() {
            return Err(KvError::new("injected put failure"));
        }
        self.rows.lock().insert(id.to_string(), row);
        Ok(())
    }

    async fn get_inline(&self, id: &DataItemId) -> Result<Option<InlineRow>, KvError> {
        Ok(self.rows.lock().get(&id.to_string()).cloned())
    }

    async fn delete_inline(&self, id: &DataItemId) -> Result<(), KvError> {
        self.rows.lock().remove(&id.to_string());
        Ok(())
    }
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    encoder.write_all(bytes).expect("gzip into memory");
    encoder.finish().expect("gzip into memory")
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, KvError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| KvError::new(format!("gunzip: {e}")))?;
    Ok(out)
}

/// Sink that lands small items as one inline row.
///
/// Only enlisted when the declared length fits the inline threshold; if the
/// body grows past it anyway the sink overflows and is dropped by the
/// fan-out, leaving the durable sinks to carry the item.
pub struct InlineKvSink {
    rows: Arc<dyn KvRows>,
    breaker: Arc<CircuitBreaker>,
    id: DataItemId,
    content_type: String,
    payload_data_start: ByteCount,
    limit: usize,
    buffer: BytesMut,
}

impl InlineKvSink {
    pub fn new(
        rows: Arc<dyn KvRows>,
        breaker: Arc<CircuitBreaker>,
        id: DataItemId,
        content_type: impl Into<String>,
        payload_data_start: ByteCount,
        limit: usize,
    ) -> Self {
        Self {
            rows,
            breaker,
            id,
            content_type: content_type.into(),
            payload_data_start,
            limit,
            buffer: BytesMut::new(),
        }
    }
}

#[async_trait]
impl ByteSink for InlineKvSink {
    fn label(&self) -> &'static str {
        "inline-kv"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if self.buffer.len() + chunk.len() > self.limit {
            return Err(SinkError::Kv {
                message: format!("item exceeds the {}-byte inline limit", self.limit),
            });
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<SinkReport, SinkError> {
        let this = *self;
        let bytes_written = this.buffer.len() as u64;
        let row = InlineRow {
            content_type: this.content_type,
            payload_data_start: this.payload_data_start,
            gzipped_item: Bytes::from(gzip(&this.buffer)),
        };
        this.breaker
            .call(this.rows.put_inline(&this.id, row))
            .await
            .map_err(|error| match error {
                BreakerError::Open { name } | BreakerError::Timeout { name } => {
                    SinkError::CircuitOpen { target: name }
                }
                BreakerError::Inner(kv) => kv.into(),
            })?;
        Ok(SinkReport {
            label: "inline-kv",
            bytes_written: ByteCount(bytes_written),
            etag: None,
        })
    }

    async fn abort(self: Box<Self>) {
        // Nothing persisted until finish; the buffer just drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("ddb", BreakerConfig::default()))
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"inline row payload".repeat(50);
        assert_eq!(gunzip(&gzip(&data)).unwrap(), data);
    }

    #[tokio::test]
    async fn sink_writes_a_compressed_row() {
        let rows = InMemoryKvRows::new();
        let id = DataItemId::from_signature(b"kv sink");
        let mut sink = Box::new(InlineKvSink::new(
            rows.clone(),
            breaker(),
            id,
            "text/plain",
            ByteCount(120),
            1024,
        ));
        sink.write(Bytes::from_static(b"raw item bytes")).await.unwrap();
        let report = sink.finish().await.unwrap();
        assert_eq!(report.bytes_written, ByteCount(14));

        let row = rows.get_inline(&id).await.unwrap().unwrap();
        assert_eq!(row.content_type, "text/plain");
        assert_eq!(row.payload_data_start, ByteCount(120));
        assert_eq!(gunzip(&row.gzipped_item).unwrap(), b"raw item bytes");
    }

    #[tokio::test]
    async fn sink_overflow_is_an_error() {
        let rows = InMemoryKvRows::new();
        let id = DataItemId::from_signature(b"kv overflow");
        let mut sink = Box::new(InlineKvSink::new(
            rows,
            breaker(),
            id,
            "text/plain",
            ByteCount(0),
            8,
        ));
        sink.write(Bytes::from_static(b"12345")).await.unwrap();
        let err = sink.write(Bytes::from_static(b"6789a")).await.unwrap_err();
        assert!(matches!(err, SinkError::Kv { .. }));
    }
}
