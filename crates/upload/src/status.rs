//! Status lookups with a read-through cache.

use std::sync::Arc;

use anchorage_primitives::{DataItemId, MultipartFailure};
use serde::{Deserialize, Serialize};

use crate::{
    db::{Database, DataItemLifecycle},
    error::UploadError,
};

/// `/tx/:id/status` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataItemStatus {
    Finalized,
    Confirmed,
    Failed,
}

impl From<DataItemLifecycle> for DataItemStatus {
    fn from(lifecycle: DataItemLifecycle) -> Self {
        match lifecycle {
            DataItemLifecycle::Finalized => Self::Finalized,
            DataItemLifecycle::Confirmed => Self::Confirmed,
            DataItemLifecycle::Failed => Self::Failed,
        }
    }
}

/// `/chunks/:token/:uploadId/status` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "status")]
pub enum MultipartUploadStatus {
    Assembling,
    Validating,
    Finalizing,
    Finalized,
    Failed { reason: MultipartFailure },
}

/// Bounded read-through cache over status lookups.
///
/// Statuses only move forward, so serving a slightly stale answer is safe;
/// the TTL bounds the staleness.
pub struct StatusCache {
    cache: moka::sync::Cache<DataItemId, DataItemStatus>,
}

impl std::fmt::Debug for StatusCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(10_000, std::time::Duration::from_secs(15))
    }
}

impl StatusCache {
    pub fn new(capacity: u64, ttl: std::time::Duration) -> Self {
        Self {
            cache: moka::sync::Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Looks up a data item's status, going to the database on a miss.
    pub async fn data_item_status(
        &self,
        db: &Arc<dyn Database>,
        id: &DataItemId,
    ) -> Result<Option<DataItemStatus>, UploadError> {
        if let Some(status) = self.cache.get(id) {
            return Ok(Some(status));
        }
        let lifecycle = db
            .get_data_item_lifecycle(id)
            .await
            .map_err(UploadError::unavailable)?;
        let Some(lifecycle) = lifecycle else {
            // Unknown ids are not cached; the very next request may be the
            // upload that creates them.
            return Ok(None);
        };
        let status = DataItemStatus::from(lifecycle);
        self.cache.insert(*id, status);
        Ok(Some(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;

    #[tokio::test]
    async fn read_through_and_remember() {
        let db = InMemoryDatabase::new();
        let id = DataItemId::from_bytes([5; 32]);
        let cache = StatusCache::default();
        let db_dyn: Arc<dyn Database> = db.clone();

        assert_eq!(cache.data_item_status(&db_dyn, &id).await.unwrap(), None);

        db.set_lifecycle(id, DataItemLifecycle::Finalized);
        assert_eq!(
            cache.data_item_status(&db_dyn, &id).await.unwrap(),
            Some(DataItemStatus::Finalized)
        );

        // Cached: a lifecycle change inside the TTL window is not observed.
        db.set_lifecycle(id, DataItemLifecycle::Confirmed);
        assert_eq!(
            cache.data_item_status(&db_dyn, &id).await.unwrap(),
            Some(DataItemStatus::Finalized)
        );
    }
}
