//! Job dispatch seam toward the downstream workers.

use std::sync::Arc;

use anchorage_primitives::DataItemId;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Jobs this core emits; the bundler/poster/optical workers consume them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Job {
    /// A validated item awaiting bundling. The hard enqueue.
    NewDataItem { id: DataItemId },
    /// Best-effort early announcement to indexers.
    OpticalPost { id: DataItemId },
    /// Best-effort unbundling of a bundled-data-item upload.
    UnbundleBdi { id: DataItemId },
    /// Deferred multipart validation.
    FinalizeMultipart { upload_id: String },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("queue: {message}")]
pub struct QueueError {
    pub message: String,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;
}

/// Collecting double for tests.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    jobs: Mutex<Vec<Job>>,
    fail_all: Mutex<bool>,
    fail_soft_only: Mutex<bool>,
}

impl InMemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    pub fn fail_all(&self, fail: bool) {
        *self.fail_all.lock() = fail;
    }

    /// Fails only the best-effort jobs, for the soft-error tests.
    pub fn fail_soft_only(&self, fail: bool) {
        *self.fail_soft_only.lock() = fail;
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        if *self.fail_all.lock() {
            return Err(QueueError {
                message: "injected enqueue failure".into(),
            });
        }
        if *self.fail_soft_only.lock()
            && matches!(job, Job::OpticalPost { .. } | Job::UnbundleBdi { .. })
        {
            return Err(QueueError {
                message: "injected soft enqueue failure".into(),
            });
        }
        self.jobs.lock().push(job);
        Ok(())
    }
}
