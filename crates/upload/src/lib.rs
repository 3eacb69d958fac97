//! Upload state machines: single-shot and multipart.
//!
//! The seams toward the payment service, the gateway, the queues and the
//! database live here as traits; production wires HTTP/AWS/SQL-backed
//! implementations, tests wire the in-memory doubles.

pub mod context;
pub mod db;
pub mod dedupe;
pub mod error;
pub mod gateway;
pub mod multipart;
pub mod payment;
pub mod queue;
pub mod single;
pub mod status;

pub use context::{UploadConfig, UploadContext};
pub use db::{Database, DataItemLifecycle, DbError, InMemoryDatabase, NewDataItemRecord};
pub use dedupe::InFlightSet;
pub use error::UploadError;
pub use gateway::{CachedGateway, FixedGateway, Gateway, GatewayError, HttpGateway};
pub use multipart::{
    DEFAULT_CHUNK_SIZE, FinalizeOutcome, MAX_CHUNK_SIZE, MAX_PART_NUMBER, MIN_CHUNK_SIZE,
    MultipartCreated, MultipartInfo, create_multipart_upload, finalize_multipart_upload,
    multipart_info, multipart_status, post_chunk,
};
pub use payment::{
    AllowAllPayment, BalanceReservation, HttpPaymentService, PaymentError, PaymentService,
    ScriptedPayment, ScriptedMode,
};
pub use queue::{InMemoryQueue, Job, JobQueue, QueueError};
pub use single::{SingleUploadRequest, handle_single_upload};
pub use status::{DataItemStatus, MultipartUploadStatus, StatusCache};

#[cfg(test)]
mod testing {
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    use anchorage_crypto::{
        StreamedBlob, Wallet, data_item_signing_payload,
    };
    use anchorage_primitives::{
        DataItemHeader, SignatureType, Tag, Winston, encode_tags,
    };
    use anchorage_storage::{
        BreakerConfig, CircuitBreaker, FsBackupStore, InMemoryKvRows, InMemoryObjectStore,
        PayloadCache,
    };
    use bytes::Bytes;
    use ed25519_dalek::Signer as _;

    use crate::{
        context::{UploadConfig, UploadContext},
        db::InMemoryDatabase,
        dedupe::InFlightSet,
        gateway::FixedGateway,
        payment::ScriptedPayment,
        queue::InMemoryQueue,
        status::StatusCache,
    };

    /// One shared RSA test wallet; 2048-bit keygen is slow enough to reuse.
    pub(crate) fn test_wallet() -> Arc<Wallet> {
        static WALLET: OnceLock<Arc<Wallet>> = OnceLock::new();
        WALLET
            .get_or_init(|| {
                let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
                    .expect("test key generation");
                Arc::new(Wallet::from_key(key))
            })
            .clone()
    }

    /// A correctly signed Ed25519 data item as raw wire bytes.
    pub(crate) fn signed_item(payload: &[u8], tags: &[Tag]) -> Vec<u8> {
        let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        let mut header = DataItemHeader {
            signature_type: SignatureType::Ed25519,
            signature: Bytes::from(vec![0u8; 64]),
            owner: Bytes::from(signing.verifying_key().to_bytes().to_vec()),
            target: None,
            anchor: Some([0xabu8; 32]),
            num_tags: tags.len() as u64,
            tags_bytes: Bytes::from(encode_tags(tags)),
        };
        let mut blob = StreamedBlob::new();
        blob.update(payload);
        let message = data_item_signing_payload(&header, blob.finalize());
        header.signature = Bytes::from(signing.sign(&message).to_bytes().to_vec());

        let mut wire = header.to_wire_bytes();
        wire.extend_from_slice(payload);
        wire
    }

    pub(crate) struct Harness {
        pub ctx: UploadContext,
        pub object: Arc<InMemoryObjectStore>,
        pub kv: Arc<InMemoryKvRows>,
        pub db: Arc<InMemoryDatabase>,
        pub queue: Arc<InMemoryQueue>,
        pub payment: Arc<ScriptedPayment>,
        pub fs_root: tempfile::TempDir,
    }

    pub(crate) fn harness() -> Harness {
        let object = InMemoryObjectStore::new();
        let kv = InMemoryKvRows::new();
        let db = InMemoryDatabase::new();
        let queue = InMemoryQueue::new();
        let payment = ScriptedPayment::new(Winston::from(491u64));
        let fs_root = tempfile::tempdir().expect("tempdir");
        let fs_breaker = Arc::new(CircuitBreaker::new("fs", BreakerConfig::default()));
        let kv_breaker = Arc::new(CircuitBreaker::new("ddb", BreakerConfig::default()));

        let ctx = UploadContext {
            config: UploadConfig::default(),
            db: db.clone(),
            payment: payment.clone(),
            gateway: FixedGateway::new(1_400_000),
            queue: queue.clone(),
            object_store: object.clone(),
            fs_store: FsBackupStore::new(fs_root.path(), fs_breaker),
            kv_rows: kv.clone(),
            kv_breaker,
            payload_cache: PayloadCache::new(64 * 1024 * 1024),
            wallet: test_wallet(),
            in_flight: Arc::new(InFlightSet::new(1000, Duration::from_secs(60))),
            status_cache: Arc::new(StatusCache::default()),
        };
        Harness {
            ctx,
            object,
            kv,
            db,
            queue,
            payment,
            fs_root,
        }
    }

    /// Wraps raw wire bytes as a chunked body stream.
    pub(crate) fn body_stream(
        wire: Vec<u8>,
        chunk_size: usize,
    ) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin + 'static {
        let chunks: Vec<Result<Bytes, std::io::Error>> = wire
            .chunks(chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        futures::stream::iter(chunks)
    }
}

#[cfg(test)]
mod single_upload_tests {
    use anchorage_crypto::verify_receipt;
    use anchorage_primitives::{DataItemId, NativeAddress, Tag};
    use anchorage_storage::raw_data_item_key;
    use bytes::Bytes;

    use crate::{
        Job, ScriptedMode, UploadError,
        single::{SingleUploadRequest, handle_single_upload},
        testing::{body_stream, harness, signed_item},
    };

    fn payer() -> NativeAddress {
        NativeAddress::from_rendered("payer-address")
    }

    fn request(
        wire: Vec<u8>,
        chunk: usize,
    ) -> SingleUploadRequest<impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin>
    {
        let content_length = Some(wire.len() as u64);
        SingleUploadRequest {
            body: body_stream(wire, chunk),
            content_length,
            content_type: Some("application/octet-stream".to_owned()),
            paid_by: Vec::new(),
        }
    }

    #[tokio::test]
    async fn small_item_round_trip() {
        let h = harness();
        let wire = signed_item(
            &[7u8; 1024],
            &[
                Tag::new("Content-Type", "text/plain"),
                Tag::new("App-Name", "tests"),
            ],
        );
        let expected_id =
            DataItemId::from_signature(&wire[2..66]).to_string();

        let receipt = handle_single_upload(&h.ctx, request(wire, 97))
            .await
            .expect("upload succeeds");

        assert_eq!(receipt.receipt.id.to_string(), expected_id);
        assert!(verify_receipt(&receipt));
        assert_eq!(receipt.receipt.deadline_height, 1_400_200);
        assert!(h.ctx.in_flight.is_empty());
        assert_eq!(h.object.object_count(), 1);
        assert!(h.object.contains(&raw_data_item_key(&receipt.receipt.id)));
        assert_eq!(h.db.data_item_count(), 1);
        // Small item: the inline row was written too.
        assert_eq!(h.kv.row_count(), 1);
        assert!(h.ctx.payload_cache.get(&receipt.receipt.id).is_some());

        let jobs = h.queue.jobs();
        assert!(jobs.contains(&Job::NewDataItem {
            id: receipt.receipt.id
        }));
        assert!(jobs.contains(&Job::OpticalPost {
            id: receipt.receipt.id
        }));
    }

    #[tokio::test]
    async fn large_item_streams_without_inline_sinks() {
        let h = harness();
        // Above the 10 KiB inline threshold: no cache, no kv row.
        let wire = signed_item(&vec![3u8; 64 * 1024], &[Tag::new("k", "v")]);
        let receipt = handle_single_upload(&h.ctx, request(wire, 1000))
            .await
            .expect("upload succeeds");
        assert_eq!(h.kv.row_count(), 0);
        assert!(h.ctx.payload_cache.get(&receipt.receipt.id).is_none());
        assert_eq!(h.object.object_count(), 1);
    }

    #[tokio::test]
    async fn chunking_does_not_change_the_outcome() {
        for chunk in [1usize, 7, 64, 4096, 1 << 20] {
            let h = harness();
            let wire = signed_item(&[9u8; 2000], &[Tag::new("a", "b")]);
            let receipt = handle_single_upload(&h.ctx, request(wire, chunk))
                .await
                .unwrap_or_else(|e| panic!("chunk {chunk}: {e}"));
            assert!(verify_receipt(&receipt));
        }
    }

    #[tokio::test]
    async fn duplicate_in_flight_gets_202_with_no_side_effects() {
        let h = harness();
        let wire = signed_item(b"dup", &[]);
        let id = DataItemId::from_signature(&wire[2..66]);
        assert!(h.ctx.in_flight.try_claim(id));

        let err = handle_single_upload(&h.ctx, request(wire, 50))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::DataItemExists));
        assert_eq!(err.status_code(), 202);
        assert_eq!(h.object.object_count(), 0);
        assert!(h.payment.charges().is_empty());
    }

    #[tokio::test]
    async fn already_recorded_item_gets_202() {
        let h = harness();
        let wire = signed_item(b"again", &[]);
        handle_single_upload(&h.ctx, request(wire.clone(), 64))
            .await
            .expect("first upload");
        let err = handle_single_upload(&h.ctx, request(wire, 64))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::DataItemExists));
    }

    #[tokio::test]
    async fn oversized_tag_blob_is_400_with_nothing_persisted() {
        let h = harness();
        let mut wire = signed_item(b"x", &[Tag::new("a", "b")]);
        // Patch numTagsBytes (8 bytes before the blob) to 5000.
        let offset = 2 + 64 + 32 + 1 + 33 + 8;
        wire[offset..offset + 8].copy_from_slice(&5000u64.to_le_bytes());

        let err = handle_single_upload(&h.ctx, request(wire, 64))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(h.object.object_count(), 0);
        assert_eq!(h.db.data_item_count(), 0);
        assert!(h.payment.charges().is_empty());
        assert!(h.ctx.in_flight.is_empty());
    }

    #[tokio::test]
    async fn tampered_signature_is_400_and_quarantined() {
        let h = harness();
        let mut wire = signed_item(&[1u8; 300], &[]);
        let last = wire.len() - 1;
        wire[last] ^= 0xff; // corrupt the payload after signing
        let id = DataItemId::from_signature(&wire[2..66]);

        let err = handle_single_upload(&h.ctx, request(wire, 64))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        // The raw object was moved to the quarantine prefix, not deleted.
        assert!(!h.object.contains(&raw_data_item_key(&id)));
        assert!(h.object.contains(&format!(
            "quarantine_{}",
            raw_data_item_key(&id)
        )));
        assert_eq!(h.db.data_item_count(), 0);
        assert!(h.payment.charges().is_empty());
        assert!(h.ctx.in_flight.is_empty());
    }

    #[tokio::test]
    async fn insufficient_on_reserve_is_402_with_quarantine_and_no_net_charge() {
        let h = harness();
        h.payment.set_mode(ScriptedMode::InsufficientOnReserve);
        let wire = signed_item(&[2u8; 500], &[]);
        let id = DataItemId::from_signature(&wire[2..66]);

        let err = handle_single_upload(&h.ctx, request(wire, 64))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 402);
        assert_eq!(h.payment.net_charged(), 0);
        assert_eq!(h.db.data_item_count(), 0);
        // S5: the persisted artifacts were renamed, not deleted.
        assert!(h.object.contains(&format!(
            "quarantine_{}",
            raw_data_item_key(&id)
        )));
        let quarantined = walk_files(h.fs_root.path())
            .into_iter()
            .filter(|name| name.starts_with("quarantine_"))
            .count();
        assert!(quarantined >= 1, "fs artifacts quarantined");
    }

    #[tokio::test]
    async fn payment_outage_before_streaming_is_503_with_nothing_persisted() {
        let h = harness();
        h.payment.set_mode(ScriptedMode::Unreachable);
        let wire = signed_item(b"x", &[]);
        let err = handle_single_upload(&h.ctx, request(wire, 64))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
        assert_eq!(h.object.object_count(), 0);
        assert_eq!(h.payment.net_charged(), 0);
    }

    #[tokio::test]
    async fn blocklisted_owner_is_403_and_quarantined() {
        let mut h = harness();
        let wire = signed_item(b"blocked", &[]);
        let item = anchorage_parser::parse_data_item(Bytes::from(wire.clone())).unwrap();
        h.ctx
            .config
            .blocklisted_addresses
            .insert(item.header.owner_address());

        let err = handle_single_upload(&h.ctx, request(wire, 64))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert_eq!(h.db.data_item_count(), 0);
        assert!(h.payment.charges().is_empty());
    }

    #[tokio::test]
    async fn spammer_content_length_is_403() {
        let h = harness();
        let spam_len = h.ctx.config.spammer_content_length.as_u64() as usize;
        // Build an item whose wire length is exactly the spam threshold.
        let header_len = signed_item(b"", &[]).len();
        let wire = signed_item(&vec![0u8; spam_len - header_len], &[]);
        assert_eq!(wire.len(), spam_len);

        let err = handle_single_upload(&h.ctx, request(wire, 4096))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SpamPattern));
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn soft_enqueue_failures_do_not_fail_the_upload() {
        let h = harness();
        h.queue.fail_soft_only(true);
        let wire = signed_item(b"soft", &[Tag::new("Bundle-Format", "binary")]);
        let receipt = handle_single_upload(&h.ctx, request(wire, 64))
            .await
            .expect("soft failures are absorbed");
        assert!(verify_receipt(&receipt));
        // The hard enqueue still made it.
        assert!(h
            .queue
            .jobs()
            .contains(&Job::NewDataItem { id: receipt.receipt.id }));
    }

    #[tokio::test]
    async fn approved_paid_by_address_is_charged() {
        let h = harness();
        let wire = signed_item(b"paid for", &[]);
        let mut request = request(wire, 64);
        request.paid_by = vec![payer()];

        let receipt = handle_single_upload(&h.ctx, request)
            .await
            .expect("approved payer funds the upload");
        assert!(verify_receipt(&receipt));
        let charges = h.payment.charges();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].0, payer());
    }

    #[tokio::test]
    async fn denied_paid_by_approval_is_402() {
        let h = harness();
        h.payment.deny_approvals(true);
        let wire = signed_item(b"unapproved", &[]);
        let mut request = request(wire, 64);
        request.paid_by = vec![payer()];

        let err = handle_single_upload(&h.ctx, request).await.unwrap_err();
        assert!(matches!(err, UploadError::ApprovalFailed));
        assert_eq!(err.status_code(), 402);
        assert!(h.payment.charges().is_empty());
        assert_eq!(h.db.data_item_count(), 0);
        assert!(h.ctx.in_flight.is_empty());
    }

    #[tokio::test]
    async fn late_failure_revokes_the_consumed_approval() {
        let h = harness();
        h.db.fail_writes(true);
        let wire = signed_item(b"revoke me", &[]);
        let mut request = request(wire, 64);
        request.paid_by = vec![payer()];

        let err = handle_single_upload(&h.ctx, request).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
        // Refund and revocation both ran against the payer.
        assert_eq!(h.payment.net_charged(), 0);
        let revokes = h.payment.revokes();
        assert_eq!(revokes.len(), 1);
        assert_eq!(revokes[0].0, payer());
    }

    #[tokio::test]
    async fn failed_revocation_supersedes_the_original_error() {
        let h = harness();
        h.db.fail_writes(true);
        h.payment.fail_revokes(true);
        let wire = signed_item(b"stuck grant", &[]);
        let mut request = request(wire, 64);
        request.paid_by = vec![payer()];

        let err = handle_single_upload(&h.ctx, request).await.unwrap_err();
        assert!(matches!(err, UploadError::RevokeFailed));
        assert_eq!(err.status_code(), 503);
        // The refund still went through before the revoke attempt.
        assert_eq!(h.payment.net_charged(), 0);
        assert!(h.payment.revokes().is_empty());
    }

    #[tokio::test]
    async fn db_failure_after_reservation_refunds() {
        let h = harness();
        h.db.fail_writes(true);
        let wire = signed_item(b"refund me", &[]);
        let err = handle_single_upload(&h.ctx, request(wire, 64))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
        assert_eq!(h.payment.charges().len(), 1);
        assert_eq!(h.payment.refunds().len(), 1);
        assert_eq!(h.payment.net_charged(), 0);
    }

    #[tokio::test]
    async fn client_disconnect_mid_payload_leaves_no_trace() {
        let h = harness();
        let wire = signed_item(&[5u8; 200_000], &[]);
        let cut = wire.len() / 2;
        let chunks: Vec<Result<Bytes, std::io::Error>> = wire[..cut]
            .chunks(4096)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .chain(std::iter::once(Err(std::io::Error::other(
                "connection reset by peer",
            ))))
            .collect();
        let request = SingleUploadRequest {
            body: futures::stream::iter(chunks),
            content_length: Some(wire.len() as u64),
            content_type: None,
            paid_by: Vec::new(),
        };

        let err = handle_single_upload(&h.ctx, request).await.unwrap_err();
        assert_eq!(err.status_code(), 503);
        // S3: sinks destroyed, nothing persisted, nothing charged.
        assert_eq!(h.object.object_count(), 0);
        assert!(h.payment.charges().is_empty());
        assert!(h.payment.refunds().is_empty());
        assert!(h.ctx.in_flight.is_empty());
        assert_eq!(walk_files(h.fs_root.path()).len(), 0);
    }

    #[tokio::test]
    async fn declared_oversize_is_rejected_immediately() {
        let h = harness();
        let request = SingleUploadRequest {
            body: body_stream(Vec::new(), 1),
            content_length: Some(h.ctx.config.max_data_item_bytes.as_u64() + 1),
            content_type: None,
            paid_by: Vec::new(),
        };
        let err = handle_single_upload(&h.ctx, request).await.unwrap_err();
        assert_eq!(err.status_code(), 413);
    }

    #[tokio::test]
    async fn wrong_content_type_is_400() {
        let h = harness();
        let request = SingleUploadRequest {
            body: body_stream(signed_item(b"x", &[]), 64),
            content_length: None,
            content_type: Some("application/json".to_owned()),
            paid_by: Vec::new(),
        };
        let err = handle_single_upload(&h.ctx, request).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidContentType { .. }));
    }

    fn walk_files(root: &std::path::Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        names
    }
}
