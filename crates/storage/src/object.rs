//! Object store: the primary durable sink.
//!
//! The production implementation is S3 (or anything S3-shaped behind
//! `AWS_ENDPOINT`); tests run against the in-memory store. Streaming
//! uploads of unknown length go through the store's multipart API in
//! 5 MiB-buffered parts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anchorage_primitives::{ByteCount, DataItemId};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::sink::{ByteSink, SinkError, SinkReport};

/// Key prefix for validated raw data items.
pub const RAW_DATA_ITEM_PREFIX: &str = "raw-data-item";
/// Key prefix for in-progress multipart assemblies.
pub const MULTIPART_PREFIX: &str = "multipart-uploads";
/// Minimum part size the multipart API accepts for all but the last part.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub fn raw_data_item_key(id: &DataItemId) -> String {
    format!("{RAW_DATA_ITEM_PREFIX}/{id}")
}

pub fn multipart_key(upload_key: &str) -> String {
    format!("{MULTIPART_PREFIX}/{upload_key}")
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("object store: {message}")]
pub struct ObjectStoreError {
    pub message: String,
}

impl ObjectStoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ObjectStoreError> for SinkError {
    fn from(error: ObjectStoreError) -> Self {
        Self::ObjectStore {
            message: error.message,
        }
    }
}

/// One completed part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartEtag {
    pub part_number: i32,
    pub etag: String,
}

/// The storage seam both upload state machines talk through.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes) -> Result<String, ObjectStoreError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, ObjectStoreError>;

    /// First `len` bytes of an object; enough to re-parse a header.
    async fn get_prefix(&self, key: &str, len: u64) -> Result<Option<Bytes>, ObjectStoreError>;

    /// Chunked read of a whole object, for bodies too large to buffer.
    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<Option<futures::stream::BoxStream<'static, Result<Bytes, std::io::Error>>>, ObjectStoreError>;

    async fn head(&self, key: &str) -> Result<Option<ByteCount>, ObjectStoreError>;

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    /// Server-side copy + delete.
    async fn rename(&self, from: &str, to: &str) -> Result<(), ObjectStoreError>;

    async fn create_multipart(&self, key: &str) -> Result<String, ObjectStoreError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, ObjectStoreError>;

    /// Parts already uploaded for an open multipart upload.
    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartEtag>, ObjectStoreError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartEtag>,
    ) -> Result<String, ObjectStoreError>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), ObjectStoreError>;
}

/// S3-backed store.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn sdk_error<E: std::fmt::Debug>(error: E) -> ObjectStoreError {
    ObjectStoreError::new(format!("{error:?}"))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Bytes) -> Result<String, ObjectStoreError> {
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(output.e_tag().unwrap_or_default().to_owned())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match output {
            Ok(object) => {
                let data = object.body.collect().await.map_err(sdk_error)?;
                Ok(Some(data.into_bytes()))
            }
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(sdk_error(error)),
        }
    }

    async fn get_prefix(&self, key: &str, len: u64) -> Result<Option<Bytes>, ObjectStoreError> {
        let range = format!("bytes=0-{}", len.saturating_sub(1));
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await;
        match output {
            Ok(object) => {
                let data = object.body.collect().await.map_err(sdk_error)?;
                Ok(Some(data.into_bytes()))
            }
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(sdk_error(error)),
        }
    }

    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<Option<futures::stream::BoxStream<'static, Result<Bytes, std::io::Error>>>, ObjectStoreError>
    {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match output {
            Ok(object) => {
                let reader = object.body.into_async_read();
                let stream = tokio_util::io::ReaderStream::new(reader);
                Ok(Some(Box::pin(stream)))
            }
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(sdk_error(error)),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ByteCount>, ObjectStoreError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match output {
            Ok(head) => Ok(Some(ByteCount(
                head.content_length().unwrap_or_default().max(0) as u64,
            ))),
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(sdk_error(error)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, from))
            .key(to)
            .send()
            .await
            .map_err(sdk_error)?;
        self.delete(from).await
    }

    async fn create_multipart(&self, key: &str) -> Result<String, ObjectStoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)?;
        output
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| ObjectStoreError::new("create_multipart_upload returned no upload id"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, ObjectStoreError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(output.e_tag().unwrap_or_default().to_owned())
    }

    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartEtag>, ObjectStoreError> {
        let output = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(output
            .parts()
            .iter()
            .filter_map(|part| {
                Some(PartEtag {
                    part_number: part.part_number()?,
                    etag: part.e_tag()?.to_owned(),
                })
            })
            .collect())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartEtag>,
    ) -> Result<String, ObjectStoreError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|part| {
                        CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(part.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(output.e_tag().unwrap_or_default().to_owned())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), ObjectStoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}

fn is_not_found<E>(error: &aws_sdk_s3::error::SdkError<E>) -> bool
where
    E: aws_sdk_s3::error::ProvideErrorMetadata,
{
    use aws_sdk_s3::error::ProvideErrorMetadata as _;
    matches!(error.code(), Some("NoSuchKey" | "NotFound" | "404"))
        || matches!(
            error.raw_response().map(|r| r.status().as_u16()),
            Some(404)
        )
}

/// In-memory store used throughout the test suites.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    multiparts: Mutex<HashMap<String, BTreeMap<i32, Bytes>>>,
    /// Inject failures for the compensation-path tests.
    fail_puts: Mutex<bool>,
}

impl InMemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_puts(&self, fail: bool) {
        *self.fail_puts.lock() = fail;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    fn staging_key(key: &str, upload_id: &str) -> String {
        format!("{key}#{upload_id}")
    }
}

fn pseudo_etag(bytes: &[u8]) -> String {
    let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in bytes {
        acc ^= u64::from(byte);
        acc = acc.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("\"{acc:016x}-{}\"", bytes.len())
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, body: Bytes) -> Result<String, ObjectStoreError> {
        if *self.fail_puts.lock() {
            return Err(ObjectStoreError::new("injected put failure"));
        }
        let etag = pseudo_etag(&body);
        self.objects.lock().insert(key.to_owned(), body);
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, ObjectStoreError> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn get_prefix(&self, key: &str, len: u64) -> Result<Option<Bytes>, ObjectStoreError> {
        Ok(self
            .objects
            .lock()
            .get(key)
            .map(|body| body.slice(..body.len().min(len as usize))))
    }

    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<Option<futures::stream::BoxStream<'static, Result<Bytes, std::io::Error>>>, ObjectStoreError>
    {
        let Some(body) = self.objects.lock().get(key).cloned() else {
            return Ok(None);
        };
        // Split into a few chunks so consumers see real chunk boundaries.
        let chunks: Vec<Result<Bytes, std::io::Error>> = body
            .chunks(64 * 1024)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(Some(Box::pin(futures::stream::iter(chunks))))
    }

    async fn head(&self, key: &str) -> Result<Option<ByteCount>, ObjectStoreError> {
        Ok(self
            .objects
            .lock()
            .get(key)
            .map(|body| ByteCount::from(body.len())))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ObjectStoreError> {
        let mut objects = self.objects.lock();
        let body = objects
            .remove(from)
            .ok_or_else(|| ObjectStoreError::new(format!("rename source missing: {from}")))?;
        objects.insert(to.to_owned(), body);
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, ObjectStoreError> {
        let upload_id = format!("mpu-{key}-{}", self.multiparts.lock().len());
        self.multiparts
            .lock()
            .insert(Self::staging_key(key, &upload_id), BTreeMap::new());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, ObjectStoreError> {
        if *self.fail_puts.lock() {
            return Err(ObjectStoreError::new("injected part failure"));
        }
        let etag = pseudo_etag(&body);
        let mut multiparts = self.multiparts.lock();
        let staging = multiparts
            .get_mut(&Self::staging_key(key, upload_id))
            .ok_or_else(|| ObjectStoreError::new("unknown multipart upload"))?;
        staging.insert(part_number, body);
        Ok(etag)
    }

    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartEtag>, ObjectStoreError> {
        let multiparts = self.multiparts.lock();
        let staging = multiparts
            .get(&Self::staging_key(key, upload_id))
            .ok_or_else(|| ObjectStoreError::new("unknown multipart upload"))?;
        Ok(staging
            .iter()
            .map(|(part_number, body)| PartEtag {
                part_number: *part_number,
                etag: pseudo_etag(body),
            })
            .collect())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartEtag>,
    ) -> Result<String, ObjectStoreError> {
        let staging = self
            .multiparts
            .lock()
            .remove(&Self::staging_key(key, upload_id))
            .ok_or_else(|| ObjectStoreError::new("unknown multipart upload"))?;
        let mut assembled = BytesMut::new();
        for part in &parts {
            let body = staging
                .get(&part.part_number)
                .ok_or_else(|| ObjectStoreError::new(format!("missing part {}", part.part_number)))?;
            assembled.extend_from_slice(body);
        }
        let body = assembled.freeze();
        let etag = pseudo_etag(&body);
        self.objects.lock().insert(key.to_owned(), body);
        Ok(etag)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), ObjectStoreError> {
        self.multiparts
            .lock()
            .remove(&Self::staging_key(key, upload_id));
        Ok(())
    }
}

/// Streaming sink over [`ObjectStore`].
///
/// Buffers up to one part; small uploads become a single `put`, larger ones
/// ride the multipart API.
pub struct ObjectSink {
    store: Arc<dyn ObjectStore>,
    key: String,
    buffer: BytesMut,
    part_size: usize,
    upload_id: Option<String>,
    parts: Vec<PartEtag>,
    bytes_written: u64,
}

impl ObjectSink {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            buffer: BytesMut::new(),
            part_size: MIN_PART_SIZE,
            upload_id: None,
            parts: Vec::new(),
            bytes_written: 0,
        }
    }

    async fn flush_part(&mut self) -> Result<(), SinkError> {
        let upload_id = match &self.upload_id {
            Some(upload_id) => upload_id.clone(),
            None => {
                let upload_id = self.store.create_multipart(&self.key).await?;
                self.upload_id = Some(upload_id.clone());
                upload_id
            }
        };
        let part_number = self.parts.len() as i32 + 1;
        let take = self.part_size.min(self.buffer.len());
        let body = self.buffer.split_to(take).freeze();
        let etag = self
            .store
            .upload_part(&self.key, &upload_id, part_number, body)
            .await?;
        self.parts.push(PartEtag { part_number, etag });
        Ok(())
    }
}

#[async_trait]
impl ByteSink for ObjectSink {
    fn label(&self) -> &'static str {
        "object-store"
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.bytes_written += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);
        while self.buffer.len() >= self.part_size {
            self.flush_part().await?;
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<SinkReport, SinkError> {
        let mut this = *self;
        let etag = match this.upload_id.clone() {
            None => this.store.put(&this.key, this.buffer.freeze()).await?,
            Some(upload_id) => {
                if !this.buffer.is_empty() {
                    this.flush_part().await?;
                }
                this.store
                    .complete_multipart(&this.key, &upload_id, this.parts)
                    .await?
            }
        };
        Ok(SinkReport {
            label: "object-store",
            bytes_written: ByteCount(this.bytes_written),
            etag: Some(etag),
        })
    }

    async fn abort(self: Box<Self>) {
        let this = *self;
        if let Some(upload_id) = this.upload_id
            && let Err(error) = this.store.abort_multipart(&this.key, &upload_id).await
        {
            tracing::warn!(key = %this.key, %error, "failed to abort multipart upload");
        }
    }
}
