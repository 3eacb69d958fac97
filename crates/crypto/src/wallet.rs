//! The service wallet: a 4096-bit RSA key in JWK form.
//!
//! Loaded once per process from whatever secrets source the deployment
//! wires in, then shared read-only. Receipts are signed with it; its public
//! modulus rides along in every receipt so clients can verify offline.

use anchorage_primitives::NativeAddress;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::{BigUint, Pss, RsaPrivateKey, traits::PublicKeyParts};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::deep_hash::DeepHashDigest;

/// RSA private key JWK, as the secrets store hands it out.
#[derive(Debug, Clone, Deserialize)]
pub struct WalletJwk {
    pub n: String,
    pub e: String,
    pub d: String,
    pub p: String,
    pub q: String,
}

/// Errors loading or using the wallet.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet JWK is not valid JSON")]
    Json(#[source] serde_json::Error),
    #[error("wallet JWK field `{field}` is not base64url")]
    Base64 { field: &'static str },
    #[error("wallet JWK does not describe a valid RSA key")]
    Key(#[source] rsa::Error),
    #[error("signing failed")]
    Sign(#[source] rsa::Error),
}

/// A loaded signing wallet.
pub struct Wallet {
    key: RsaPrivateKey,
    /// base64url of the public modulus, precomputed; every receipt carries it.
    public: String,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.owner_address())
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Parses a JWK JSON document.
    pub fn from_jwk_json(json: &str) -> Result<Self, WalletError> {
        let jwk: WalletJwk = serde_json::from_str(json).map_err(WalletError::Json)?;
        Self::from_jwk(&jwk)
    }

    pub fn from_jwk(jwk: &WalletJwk) -> Result<Self, WalletError> {
        let n = decode_field(&jwk.n, "n")?;
        let e = decode_field(&jwk.e, "e")?;
        let d = decode_field(&jwk.d, "d")?;
        let p = decode_field(&jwk.p, "p")?;
        let q = decode_field(&jwk.q, "q")?;
        let key = RsaPrivateKey::from_components(
            BigUint::from_bytes_be(&n),
            BigUint::from_bytes_be(&e),
            BigUint::from_bytes_be(&d),
            vec![BigUint::from_bytes_be(&p), BigUint::from_bytes_be(&q)],
        )
        .map_err(WalletError::Key)?;
        Ok(Self::from_key(key))
    }

    /// Wraps an already-constructed key (tests, key generation tooling).
    pub fn from_key(key: RsaPrivateKey) -> Self {
        let public = URL_SAFE_NO_PAD.encode(key.n().to_bytes_be());
        Self { key, public }
    }

    /// base64url public modulus.
    pub fn public_modulus(&self) -> &str {
        &self.public
    }

    /// The wallet's own native address (base64url SHA-256 of the modulus).
    pub fn owner_address(&self) -> NativeAddress {
        let modulus = self.key.n().to_bytes_be();
        NativeAddress::from_rendered(URL_SAFE_NO_PAD.encode(Sha256::digest(modulus)))
    }

    /// RSA-PSS (SHA-256, zero salt) over a deep-hash digest.
    pub fn sign_deep_hash(&self, digest: &DeepHashDigest) -> Result<Vec<u8>, WalletError> {
        let hashed = Sha256::digest(digest);
        self.key
            .sign_with_rng(
                &mut rand::thread_rng(),
                Pss::new_with_salt::<Sha256>(0),
                &hashed,
            )
            .map_err(WalletError::Sign)
    }
}

fn decode_field(value: &str, field: &'static str) -> Result<Vec<u8>, WalletError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| WalletError::Base64 { field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::verify_rsa;

    fn test_wallet() -> Wallet {
        // 2048 bits keeps key generation fast; signing is size-agnostic.
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        Wallet::from_key(key)
    }

    #[test]
    fn signatures_verify_under_the_public_modulus() {
        let wallet = test_wallet();
        let digest = [0x5au8; 48];
        let signature = wallet.sign_deep_hash(&digest).unwrap();
        let modulus = URL_SAFE_NO_PAD.decode(wallet.public_modulus()).unwrap();
        assert!(verify_rsa(&modulus, &digest, &signature));
        assert!(!verify_rsa(&modulus, &[0u8; 48], &signature));
    }

    #[test]
    fn owner_address_is_stable() {
        let wallet = test_wallet();
        assert_eq!(wallet.owner_address(), wallet.owner_address());
    }

    #[test]
    fn bad_jwk_is_rejected() {
        assert!(matches!(
            Wallet::from_jwk_json("not json"),
            Err(WalletError::Json(_))
        ));
        let jwk = WalletJwk {
            n: "###".into(),
            e: "AQAB".into(),
            d: "AA".into(),
            p: "AA".into(),
            q: "AA".into(),
        };
        assert!(matches!(
            Wallet::from_jwk(&jwk),
            Err(WalletError::Base64 { field: "n" })
        ));
    }
}
