//! Environment configuration.

use std::collections::HashSet;
use std::path::PathBuf;

use anchorage_primitives::{ByteCount, NativeAddress};
use anchorage_upload::UploadConfig;

/// Everything the process reads from its environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub aws_region: Option<String>,
    /// Non-AWS endpoint (localstack, minio) for both S3 and DynamoDB.
    pub aws_endpoint: Option<String>,
    pub bucket: String,
    pub dynamodb_table: String,
    /// Root of the filesystem backup, `EFS_MOUNT_POINT`.
    pub efs_mount_point: PathBuf,
    pub payment_service_url: String,
    pub gateway_url: String,
    /// JWK JSON for the signing wallet, or a path to read it from.
    pub wallet_jwk: WalletSource,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone)]
pub enum WalletSource {
    Inline(String),
    File(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required env var `{name}` is missing")]
    Missing { name: &'static str },
    #[error("env var `{name}` is not a number")]
    NotANumber { name: &'static str },
}

fn optional(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing { name })
}

impl ServiceConfig {
    /// Reads the full configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut upload = UploadConfig {
            skip_balance_checks: optional("SKIP_BALANCE_CHECKS").as_deref() == Some("true"),
            optical_bridging_enabled: optional("OPTICAL_BRIDGING_ENABLED").as_deref()
                != Some("false"),
            ..UploadConfig::default()
        };
        if let Some(raw) = optional("SPAMMER_CONTENT_LENGTH") {
            let length = raw.parse::<u64>().map_err(|_| ConfigError::NotANumber {
                name: "SPAMMER_CONTENT_LENGTH",
            })?;
            upload.spammer_content_length = ByteCount(length);
        }
        if let Some(raw) = optional("MAX_DATA_ITEM_BYTES") {
            let max = raw.parse::<u64>().map_err(|_| ConfigError::NotANumber {
                name: "MAX_DATA_ITEM_BYTES",
            })?;
            upload.max_data_item_bytes = ByteCount(max);
        }
        upload.blocklisted_addresses = address_set(optional("BLOCKLISTED_ADDRESSES"));
        upload.allowlisted_addresses = address_set(optional("ALLOW_LISTED_ADDRESSES"));

        let wallet_jwk = match optional("WALLET_JWK") {
            Some(inline) => WalletSource::Inline(inline),
            None => WalletSource::File(PathBuf::from(required("WALLET_FILE")?)),
        };

        Ok(Self {
            aws_region: optional("AWS_REGION"),
            aws_endpoint: optional("AWS_ENDPOINT"),
            bucket: optional("DATA_ITEM_BUCKET").unwrap_or_else(|| "raw-data-items".to_owned()),
            dynamodb_table: optional("DYNAMODB_TABLE").unwrap_or_else(|| "inline-data-items".to_owned()),
            efs_mount_point: PathBuf::from(
                optional("EFS_MOUNT_POINT").unwrap_or_else(|| "/mnt/upload-service".to_owned()),
            ),
            payment_service_url: optional("PAYMENT_SERVICE_BASE_URL")
                .unwrap_or_else(|| "https://payment.ardrive.io".to_owned()),
            gateway_url: optional("ARWEAVE_GATEWAY")
                .unwrap_or_else(|| "https://arweave.net".to_owned()),
            wallet_jwk,
            upload,
        })
    }
}

fn address_set(raw: Option<String>) -> HashSet<NativeAddress> {
    raw.map(|joined| {
        joined
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(NativeAddress::from_rendered)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_sets_split_on_commas() {
        let set = address_set(Some("addr1, addr2,,addr3".to_owned()));
        assert_eq!(set.len(), 3);
        assert!(set.contains(&NativeAddress::from_rendered("addr2")));
    }
}
