//! Process context assembly.
//!
//! One pass in `main`: load the wallet, build the AWS clients, wire every
//! store and cache, and hand back the immutable context the handlers share.

use std::sync::Arc;
use std::time::Duration;

use anchorage_crypto::Wallet;
use anchorage_storage::{
    BreakerConfig, CircuitBreaker, DynamoDbKvRows, FsBackupStore, PayloadCache, S3ObjectStore,
};
use anchorage_upload::{
    CachedGateway, HttpGateway, HttpPaymentService, InFlightSet, InMemoryDatabase, InMemoryQueue,
    StatusCache, UploadContext,
};
use eyre::WrapErr as _;

use crate::config::{ServiceConfig, WalletSource};

/// Height cache TTL: one gateway round trip per minute at most.
const GATEWAY_CACHE_TTL: Duration = Duration::from_secs(60);
/// Bound on the in-memory payload cache.
const PAYLOAD_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Builds the shared context from configuration.
pub async fn build_context(config: &ServiceConfig) -> eyre::Result<Arc<UploadContext>> {
    let wallet = load_wallet(&config.wallet_jwk).wrap_err("load service wallet")?;
    tracing::info!(address = %wallet.owner_address(), "service wallet loaded");

    let mut aws = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.aws_region {
        aws = aws.region(aws_config::Region::new(region.clone()));
    }
    if let Some(endpoint) = &config.aws_endpoint {
        aws = aws.endpoint_url(endpoint);
    }
    let aws = aws.load().await;

    let object_store = Arc::new(S3ObjectStore::new(
        aws_sdk_s3::Client::new(&aws),
        config.bucket.clone(),
    ));
    let kv_rows = Arc::new(DynamoDbKvRows::new(
        aws_sdk_dynamodb::Client::new(&aws),
        config.dynamodb_table.clone(),
    ));

    let fs_breaker = Arc::new(CircuitBreaker::new("fs", BreakerConfig::default()));
    let kv_breaker = Arc::new(CircuitBreaker::new("dynamodb", BreakerConfig::default()));
    let fs_store = FsBackupStore::new(&config.efs_mount_point, fs_breaker);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .wrap_err("build http client")?;
    let payment = Arc::new(HttpPaymentService::new(
        http.clone(),
        config.payment_service_url.clone(),
    ));
    let gateway = Arc::new(CachedGateway::new(
        Arc::new(HttpGateway::new(http, config.gateway_url.clone())),
        GATEWAY_CACHE_TTL,
    ));

    // The durable row store and the queue broker are deployment concerns;
    // until a deployment wires its own, the in-process implementations keep
    // a single-node service fully functional.
    let db = InMemoryDatabase::new();
    let queue = InMemoryQueue::new();

    Ok(Arc::new(UploadContext {
        config: config.upload.clone(),
        db,
        payment,
        gateway,
        queue,
        object_store,
        fs_store,
        kv_rows,
        kv_breaker,
        payload_cache: PayloadCache::new(PAYLOAD_CACHE_BYTES),
        wallet: Arc::new(wallet),
        in_flight: Arc::new(InFlightSet::default()),
        status_cache: Arc::new(StatusCache::default()),
    }))
}

fn load_wallet(source: &WalletSource) -> eyre::Result<Wallet> {
    let json = match source {
        WalletSource::Inline(json) => json.clone(),
        WalletSource::File(path) => std::fs::read_to_string(path)
            .wrap_err_with(|| format!("read wallet file {}", path.display()))?,
    };
    Wallet::from_jwk_json(&json).wrap_err("parse wallet JWK")
}
