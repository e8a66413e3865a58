//! HMAC-SHA256 search tokens for equality lookups over encrypted fields
//!
//! Tokens are keyed with a dedicated secret that is never used for encryption.
//! The field label is part of the MAC input, so the same literal under two
//! field types yields unrelated tokens.

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::info;
use zeroize::Zeroizing;

use super::key_store::KeyStore;
use crate::error::{PhiError, Result};
use crate::fields::PhiFieldType;

type HmacSha256 = Hmac<Sha256>;

pub const SEARCH_SECRET_LEN: usize = 32;
const MIN_SECRET_LEN: usize = 16;

pub struct HmacSearchService {
    secret: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for HmacSearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSearchService")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Fresh random secret suitable for [`HmacSearchService::new`]
pub fn generate_search_secret() -> Zeroizing<Vec<u8>> {
    let mut secret = Zeroizing::new(vec![0u8; SEARCH_SECRET_LEN]);
    OsRng.fill_bytes(&mut secret);
    secret
}

impl HmacSearchService {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(PhiError::Config(format!(
                "Search secret too short: {} bytes (minimum {})",
                secret.len(),
                MIN_SECRET_LEN
            )));
        }
        Ok(Self {
            secret: Zeroizing::new(secret.to_vec()),
        })
    }

    /// Load the secret from `store`, generating and persisting one on first use
    pub fn from_store(store: &dyn KeyStore) -> Result<Self> {
        if let Some(secret) = store.load_search_secret()? {
            return Self::new(&secret);
        }

        let secret = generate_search_secret();
        store.save_search_secret(&secret)?;
        info!("Generated new search-token secret");
        Self::new(&secret)
    }

    fn normalize(plaintext: &str) -> String {
        plaintext.trim().to_lowercase()
    }

    fn compute(&self, plaintext: &str, field_type: PhiFieldType) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| PhiError::Encryption(format!("HMAC initialization failed: {}", e)))?;
        let message = format!("{}:{}", field_type.as_str(), Self::normalize(plaintext));
        mac.update(message.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Deterministic hex token for `plaintext` under `field_type`
    pub fn generate_search_token(&self, plaintext: &str, field_type: PhiFieldType) -> Result<String> {
        Ok(hex::encode(self.compute(plaintext, field_type)?))
    }

    /// Constant-time check of `token` against `plaintext`. Malformed tokens are
    /// simply a mismatch.
    pub fn verify_token(&self, plaintext: &str, token: &str, field_type: PhiFieldType) -> bool {
        let Ok(expected) = hex::decode(token.trim()) else {
            return false;
        };
        match self.compute(plaintext, field_type) {
            Ok(computed) => computed.ct_eq(&expected).into(),
            Err(_) => false,
        }
    }
}
