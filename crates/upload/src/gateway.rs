//! Gateway seam: the only fact we need from the chain is its height.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

#[derive(Debug, Clone, thiserror::Error)]
#[error("gateway unreachable: {message}")]
pub struct GatewayError {
    pub message: String,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn current_block_height(&self) -> Result<u64, GatewayError>;
}

/// HTTP gateway client (`GET <base>/info`).
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    height: u64,
}

impl HttpGateway {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn current_block_height(&self) -> Result<u64, GatewayError> {
        let url = format!("{}/info", self.base_url);
        let response = self.client.get(url).send().await.map_err(|e| GatewayError {
            message: e.to_string(),
        })?;
        let info: InfoResponse = response.json().await.map_err(|e| GatewayError {
            message: e.to_string(),
        })?;
        Ok(info.height)
    }
}

/// Height cache so a burst of uploads costs one gateway round trip.
pub struct CachedGateway {
    inner: Arc<dyn Gateway>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, u64)>>,
}

impl CachedGateway {
    pub fn new(inner: Arc<dyn Gateway>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Gateway for CachedGateway {
    async fn current_block_height(&self) -> Result<u64, GatewayError> {
        if let Some((at, height)) = *self.cached.lock()
            && at.elapsed() < self.ttl
        {
            return Ok(height);
        }
        let height = self.inner.current_block_height().await?;
        *self.cached.lock() = Some((Instant::now(), height));
        Ok(height)
    }
}

/// Fixed-height double for tests.
#[derive(Debug)]
pub struct FixedGateway {
    pub height: u64,
}

impl FixedGateway {
    pub fn new(height: u64) -> Arc<Self> {
        Arc::new(Self { height })
    }
}

#[async_trait]
impl Gateway for FixedGateway {
    async fn current_block_height(&self) -> Result<u64, GatewayError> {
        Ok(self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingGateway {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Gateway for CountingGateway {
        async fn current_block_height(&self) -> Result<u64, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(1234)
        }
    }

    #[tokio::test]
    async fn cached_gateway_coalesces_lookups() {
        let inner = Arc::new(CountingGateway {
            calls: AtomicU64::new(0),
        });
        let cached = CachedGateway::new(inner.clone(), Duration::from_secs(60));
        for _ in 0..5 {
            assert_eq!(cached.current_block_height().await.unwrap(), 1234);
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
