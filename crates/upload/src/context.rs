//! Process context threaded through the state machines.
//!
//! Everything that used to be a singleton — wallet, stores, clients,
//! caches, breakers — is assembled once in `main` and handed down
//! explicitly.

use std::collections::HashSet;
use std::sync::Arc;

use anchorage_crypto::Wallet;
use anchorage_primitives::{ByteCount, NativeAddress};
use anchorage_storage::{CircuitBreaker, FsBackupStore, KvRows, ObjectStore, PayloadCache};

use crate::{
    db::Database, dedupe::InFlightSet, gateway::Gateway, payment::PaymentService, queue::JobQueue,
    status::StatusCache,
};

/// Tunables for both upload state machines.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Hard cap on one data item, header included.
    pub max_data_item_bytes: ByteCount,
    /// Items at or below this are buffered and parsed in memory, and also
    /// fan out to the payload cache and the inline KV row.
    pub inline_threshold_bytes: ByteCount,
    /// `SKIP_BALANCE_CHECKS=true`: every upload is treated as funded.
    pub skip_balance_checks: bool,
    /// `OPTICAL_BRIDGING_ENABLED=false` disables the optical enqueue.
    pub optical_bridging_enabled: bool,
    /// Exact declared length the spam guard rejects for unknown uploaders.
    pub spammer_content_length: ByteCount,
    /// Blocks added to the current height to form the receipt deadline.
    pub deadline_height_increment: u64,
    /// Gateways advertised in receipts as already holding the bytes.
    pub data_caches: Vec<String>,
    /// Indexers advertised in receipts for fast finality.
    pub fast_finality_indexes: Vec<String>,
    /// Owner addresses refused outright.
    pub blocklisted_addresses: HashSet<NativeAddress>,
    /// Uploaders exempt from the spam guard.
    pub allowlisted_addresses: HashSet<NativeAddress>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_data_item_bytes: ByteCount(10 * 1024 * 1024 * 1024),
            inline_threshold_bytes: ByteCount(10 * 1024),
            skip_balance_checks: false,
            optical_bridging_enabled: true,
            spammer_content_length: ByteCount(100_372),
            deadline_height_increment: 200,
            data_caches: vec!["arweave.net".to_owned()],
            fast_finality_indexes: Vec::new(),
            blocklisted_addresses: HashSet::new(),
            allowlisted_addresses: HashSet::new(),
        }
    }
}

/// Shared, immutable service context.
pub struct UploadContext {
    pub config: UploadConfig,
    pub db: Arc<dyn Database>,
    pub payment: Arc<dyn PaymentService>,
    pub gateway: Arc<dyn Gateway>,
    pub queue: Arc<dyn JobQueue>,
    pub object_store: Arc<dyn ObjectStore>,
    pub fs_store: FsBackupStore,
    pub kv_rows: Arc<dyn KvRows>,
    pub kv_breaker: Arc<CircuitBreaker>,
    pub payload_cache: PayloadCache,
    pub wallet: Arc<Wallet>,
    pub in_flight: Arc<InFlightSet>,
    pub status_cache: Arc<StatusCache>,
}

impl std::fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
