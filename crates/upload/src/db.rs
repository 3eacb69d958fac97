//! Database seam.
//!
//! Schema and SQL belong to the deployment; the state machines only need
//! these operations. The in-memory implementation backs the test suites and
//! doubles as the reference semantics.

use std::collections::HashMap;
use std::sync::Arc;

use anchorage_primitives::{
    ByteCount, DataItemId, MultipartFailure, MultipartUpload, NativeAddress, PremiumFeatureType,
    SignatureType, Winston,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
#[error("database: {message}")]
pub struct DbError {
    pub message: String,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The durable row recorded for every accepted data item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataItemRecord {
    pub data_item_id: DataItemId,
    pub owner_native_address: NativeAddress,
    pub signature_type: SignatureType,
    pub byte_count: ByteCount,
    pub payload_content_type: String,
    pub payload_data_start: ByteCount,
    pub premium_feature_type: PremiumFeatureType,
    pub uploaded_timestamp: u64,
    pub deadline_height: u64,
    pub assessed_winc_price: Winston,
}

/// Lifecycle as reported by `/tx/:id/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataItemLifecycle {
    /// Recorded and awaiting bundling.
    Finalized,
    /// Anchored on the permanent-storage network.
    Confirmed,
    Failed,
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn insert_new_data_item(&self, record: NewDataItemRecord) -> Result<(), DbError>;

    async fn get_data_item(&self, id: &DataItemId)
    -> Result<Option<NewDataItemRecord>, DbError>;

    async fn get_data_item_lifecycle(
        &self,
        id: &DataItemId,
    ) -> Result<Option<DataItemLifecycle>, DbError>;

    async fn insert_multipart(&self, upload: MultipartUpload) -> Result<(), DbError>;

    async fn get_multipart(&self, upload_id: &str) -> Result<Option<MultipartUpload>, DbError>;

    /// Records the larger chunk size a client started sending.
    async fn update_multipart_chunk_size(
        &self,
        upload_id: &str,
        chunk_size: ByteCount,
    ) -> Result<(), DbError>;

    /// Records a completed object-store assembly before validation runs, so
    /// a re-entrant finalize never re-lists parts of a closed upload.
    async fn record_multipart_assembly(&self, upload_id: &str, etag: &str)
    -> Result<(), DbError>;

    /// Marks assembly + validation complete.
    async fn finalize_multipart(
        &self,
        upload_id: &str,
        data_item_id: DataItemId,
        etag: &str,
    ) -> Result<(), DbError>;

    async fn fail_multipart(
        &self,
        upload_id: &str,
        reason: MultipartFailure,
    ) -> Result<(), DbError>;
}

/// In-memory reference implementation.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    data_items: Mutex<HashMap<DataItemId, NewDataItemRecord>>,
    lifecycles: Mutex<HashMap<DataItemId, DataItemLifecycle>>,
    multiparts: Mutex<HashMap<String, MultipartUpload>>,
    fail_writes: Mutex<bool>,
}

impl InMemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    pub fn data_item_count(&self) -> usize {
        self.data_items.lock().len()
    }

    /// Test hook: move an item through its post-upload lifecycle.
    pub fn set_lifecycle(&self, id: DataItemId, lifecycle: DataItemLifecycle) {
        self.lifecycles.lock().insert(id, lifecycle);
    }

    /// Test hook: wind a recorded item back out, as if the row insert never
    /// happened.
    pub fn remove_data_item_for_tests(&self, id: &DataItemId) {
        self.data_items.lock().remove(id);
        self.lifecycles.lock().remove(id);
    }

    fn check_writes(&self) -> Result<(), DbError> {
        if *self.fail_writes.lock() {
            return Err(DbError::new("injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn insert_new_data_item(&self, record: NewDataItemRecord) -> Result<(), DbError> {
        self.check_writes()?;
        let id = record.data_item_id;
        self.data_items.lock().insert(id, record);
        self.lifecycles
            .lock()
            .entry(id)
            .or_insert(DataItemLifecycle::Finalized);
        Ok(())
    }

    async fn get_data_item(
        &self,
        id: &DataItemId,
    ) -> Result<Option<NewDataItemRecord>, DbError> {
        Ok(self.data_items.lock().get(id).cloned())
    }

    async fn get_data_item_lifecycle(
        &self,
        id: &DataItemId,
    ) -> Result<Option<DataItemLifecycle>, DbError> {
        Ok(self.lifecycles.lock().get(id).copied())
    }

    async fn insert_multipart(&self, upload: MultipartUpload) -> Result<(), DbError> {
        self.check_writes()?;
        self.multiparts
            .lock()
            .insert(upload.upload_id.clone(), upload);
        Ok(())
    }

    async fn get_multipart(&self, upload_id: &str) -> Result<Option<MultipartUpload>, DbError> {
        Ok(self.multiparts.lock().get(upload_id).cloned())
    }

    async fn update_multipart_chunk_size(
        &self,
        upload_id: &str,
        chunk_size: ByteCount,
    ) -> Result<(), DbError> {
        self.check_writes()?;
        let mut multiparts = self.multiparts.lock();
        let upload = multiparts
            .get_mut(upload_id)
            .ok_or_else(|| DbError::new(format!("unknown multipart upload {upload_id}")))?;
        upload.chunk_size = chunk_size;
        Ok(())
    }

    async fn record_multipart_assembly(
        &self,
        upload_id: &str,
        etag: &str,
    ) -> Result<(), DbError> {
        self.check_writes()?;
        let mut multiparts = self.multiparts.lock();
        let upload = multiparts
            .get_mut(upload_id)
            .ok_or_else(|| DbError::new(format!("unknown multipart upload {upload_id}")))?;
        upload.etag = Some(etag.to_owned());
        upload.store_upload_id = None;
        Ok(())
    }

    async fn finalize_multipart(
        &self,
        upload_id: &str,
        data_item_id: DataItemId,
        etag: &str,
    ) -> Result<(), DbError> {
        self.check_writes()?;
        let mut multiparts = self.multiparts.lock();
        let upload = multiparts
            .get_mut(upload_id)
            .ok_or_else(|| DbError::new(format!("unknown multipart upload {upload_id}")))?;
        upload.data_item_id = Some(data_item_id);
        upload.etag = Some(etag.to_owned());
        upload.store_upload_id = None;
        upload.failed_reason = None;
        Ok(())
    }

    async fn fail_multipart(
        &self,
        upload_id: &str,
        reason: MultipartFailure,
    ) -> Result<(), DbError> {
        self.check_writes()?;
        let mut multiparts = self.multiparts.lock();
        let upload = multiparts
            .get_mut(upload_id)
            .ok_or_else(|| DbError::new(format!("unknown multipart upload {upload_id}")))?;
        upload.failed_reason = Some(reason);
        Ok(())
    }
}
