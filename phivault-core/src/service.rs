//! PHI Encryption Service
//!
//! Facade over the key manager, the search-token service, the decryption
//! rate limiter and the audit log. Construct one per process and share it
//! behind an `Arc`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::audit::{
    AuditSink, AuditStats, DecryptionAuditEntry, DecryptionAuditLog, FileAuditSink,
    DEFAULT_BUFFER_SIZE,
};
use crate::config::PhiConfig;
use crate::crypto;
use crate::error::{PhiError, Result};
use crate::fields::{PhiFieldType, SensitivityTier};
use crate::security::{
    DecryptionRateLimiter, FileKeyStore, HmacSearchService, KeyManager, KeyMetadata, KeyPolicy,
    KeyStatus, KeyStore, RateLimitConfig, RateLimitStats,
};
use crate::value::{EncryptedValue, SearchableEncryptedValue, ENCRYPTION_VERSION};

/// Principal recorded in the audit log for re-encryption sweeps
pub const REENCRYPT_PRINCIPAL: &str = "system:re-encrypt";

/// Result of a key rotation, safe to log or print
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RotationOutcome {
    pub old_key_id: Option<String>,
    pub new_key_id: String,
    pub rotation_count: u32,
    pub rotated_at: DateTime<Utc>,
}

pub struct PhiEncryptionService {
    keys: KeyManager,
    search: HmacSearchService,
    limiter: DecryptionRateLimiter,
    audit: DecryptionAuditLog,
}

impl std::fmt::Debug for PhiEncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhiEncryptionService")
            .field("keys", &self.keys)
            .field("search", &self.search)
            .field("limiter", &self.limiter.config())
            .field("audit_entries", &self.audit.len())
            .finish()
    }
}

impl PhiEncryptionService {
    pub fn new(
        keys: KeyManager,
        search: HmacSearchService,
        limiter: DecryptionRateLimiter,
        audit: DecryptionAuditLog,
    ) -> Self {
        Self {
            keys,
            search,
            limiter,
            audit,
        }
    }

    /// Build a service over `store`, loading (or creating) the search secret
    /// from the same store.
    pub fn with_store(
        store: Arc<dyn KeyStore>,
        policy: KeyPolicy,
        limits: RateLimitConfig,
        sink: Box<dyn AuditSink>,
    ) -> Result<Self> {
        let search = HmacSearchService::from_store(store.as_ref())?;
        let keys = KeyManager::new(store, policy)?;
        Ok(Self::new(
            keys,
            search,
            DecryptionRateLimiter::new(limits),
            DecryptionAuditLog::new(sink, DEFAULT_BUFFER_SIZE),
        ))
    }

    /// File-backed service wired from configuration
    pub fn from_config(config: &PhiConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn KeyStore> = Arc::new(FileKeyStore::new(
            config.storage.key_file.clone(),
            config.storage.search_secret_file.clone(),
        ));
        let search = HmacSearchService::from_store(store.as_ref())?;
        let keys = KeyManager::new(store, KeyPolicy::from(&config.keys))?;
        let sink = FileAuditSink::open(config.audit.log_file.clone())?;
        let history = match sink.read_recent(config.audit.buffer_size) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Audit history unreadable, statistics start empty");
                Vec::new()
            }
        };

        let audit = DecryptionAuditLog::new(Box::new(sink), config.audit.buffer_size);
        audit.preload(history);

        info!(
            key_file = %config.storage.key_file.display(),
            audit_log = %config.audit.log_file.display(),
            audit_entries = audit.len(),
            "PHI encryption service ready"
        );

        Ok(Self::new(
            keys,
            search,
            DecryptionRateLimiter::new(RateLimitConfig::from(&config.rate_limits)),
            audit,
        ))
    }

    pub fn get_sensitivity_tier(&self, field_type: PhiFieldType) -> SensitivityTier {
        field_type.sensitivity_tier()
    }

    #[instrument(skip_all, fields(field_type = %field_type))]
    pub fn encrypt_phi(&self, plaintext: &str, field_type: PhiFieldType) -> Result<EncryptedValue> {
        if plaintext.is_empty() {
            return Err(PhiError::EmptyPlaintext);
        }

        let key = self.keys.get_active_key()?;
        let aad = EncryptedValue::associated_data(&key.key_id, field_type, ENCRYPTION_VERSION);
        let ciphertext = crypto::seal(&key.key_material, plaintext.as_bytes(), &aad)?;

        debug!(key_id = %key.key_id, "PHI field encrypted");
        Ok(EncryptedValue {
            ciphertext,
            key_id: key.key_id,
            field_type,
            encrypted_at: Utc::now(),
            version: ENCRYPTION_VERSION,
        })
    }

    /// Decrypt one value on behalf of `user_id`.
    ///
    /// Every call, successful or not, produces exactly one audit entry.
    pub fn decrypt_phi(
        &self,
        encrypted: &EncryptedValue,
        user_id: &str,
        record_id: Option<&str>,
        client_ip: Option<&str>,
    ) -> Result<String> {
        self.decrypt_audited(encrypted, user_id, record_id, client_ip, true)
    }

    fn decrypt_audited(
        &self,
        encrypted: &EncryptedValue,
        user_id: &str,
        record_id: Option<&str>,
        client_ip: Option<&str>,
        rate_limited: bool,
    ) -> Result<String> {
        let fail = |err: PhiError| -> PhiError {
            let entry = DecryptionAuditEntry::failure(
                user_id,
                encrypted.field_type,
                &encrypted.key_id,
                record_id,
                client_ip,
                err.to_string(),
            );
            // The original error is the more useful one for the caller; a
            // sink failure is already logged by the audit log.
            let _ = self.audit.log_decryption(entry);
            err
        };

        // The slot is taken before any key lookup and handed back if no
        // plaintext comes out, so concurrent callers cannot pass a cap together
        let slot = if rate_limited {
            match self.limiter.acquire(user_id) {
                Ok(slot) => Some(slot),
                Err(denial) => {
                    return Err(fail(PhiError::RateLimitExceeded {
                        user_id: user_id.to_string(),
                        window: denial.window.to_string(),
                        limit: denial.limit,
                    }))
                }
            }
        } else {
            None
        };
        let release = || {
            if let Some(slot) = slot {
                self.limiter.release(user_id, slot);
            }
        };

        let Some(key) = self.keys.get_key(&encrypted.key_id) else {
            warn!(key_id = %encrypted.key_id, "Ciphertext references an unknown key");
            release();
            return Err(fail(PhiError::KeyNotFound(encrypted.key_id.clone())));
        };

        let plaintext = crypto::open(&key.key_material, &encrypted.ciphertext, &encrypted.aad())
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| PhiError::Decryption("Plaintext is not valid UTF-8".to_string()))
            })
            .map_err(|e| {
                release();
                fail(e)
            })?;

        // A decryption whose audit write fails keeps its slot; the plaintext
        // existed in memory even though it is withheld
        self.audit.log_decryption(DecryptionAuditEntry::success(
            user_id,
            encrypted.field_type,
            &encrypted.key_id,
            record_id,
            client_ip,
        ))?;

        Ok(plaintext)
    }

    /// Encrypt and tokenize. Returns the encoded [`EncryptedValue`] and its search token.
    pub fn encrypt_searchable(
        &self,
        plaintext: &str,
        field_type: PhiFieldType,
    ) -> Result<(String, String)> {
        let encrypted = self.encrypt_phi(plaintext, field_type)?;
        let token = self.search.generate_search_token(plaintext, field_type)?;
        Ok((encrypted.encode()?, token))
    }

    pub fn encrypt_searchable_value(
        &self,
        plaintext: &str,
        field_type: PhiFieldType,
    ) -> Result<SearchableEncryptedValue> {
        let (encrypted_value, search_token) = self.encrypt_searchable(plaintext, field_type)?;
        Ok(SearchableEncryptedValue {
            encrypted_value,
            search_token,
            field_type,
            created_at: Utc::now(),
        })
    }

    pub fn create_search_token(&self, plaintext: &str, field_type: PhiFieldType) -> Result<String> {
        self.search.generate_search_token(plaintext, field_type)
    }

    pub fn verify_search_token(&self, plaintext: &str, token: &str, field_type: PhiFieldType) -> bool {
        self.search.verify_token(plaintext, token, field_type)
    }

    /// Encrypt the named fields of `record`.
    ///
    /// Only non-empty string values are encrypted; each is replaced by its
    /// encoded [`EncryptedValue`]. Everything else is copied as is.
    pub fn encrypt_dict(
        &self,
        record: &Map<String, Value>,
        fields: &[(&str, PhiFieldType)],
    ) -> Result<Map<String, Value>> {
        let mut out = record.clone();
        for &(name, field_type) in fields {
            let Some(Value::String(plaintext)) = record.get(name) else {
                continue;
            };
            if plaintext.is_empty() {
                continue;
            }
            let encoded = self.encrypt_phi(plaintext, field_type)?.encode()?;
            out.insert(name.to_string(), Value::String(encoded));
        }
        Ok(out)
    }

    /// Decrypt the named fields of `record`. Fields that do not hold an
    /// encoded [`EncryptedValue`] of the declared field type are left as they are.
    pub fn decrypt_dict(
        &self,
        record: &Map<String, Value>,
        fields: &[(&str, PhiFieldType)],
        user_id: &str,
        record_id: Option<&str>,
        client_ip: Option<&str>,
    ) -> Result<Map<String, Value>> {
        let mut out = record.clone();
        for &(name, field_type) in fields {
            let Some(Value::String(candidate)) = record.get(name) else {
                continue;
            };
            let Ok(encrypted) = EncryptedValue::decode(candidate) else {
                debug!(field = name, "Field is not encrypted, passing through");
                continue;
            };
            if encrypted.field_type != field_type {
                warn!(
                    field = name,
                    declared = %field_type,
                    stored = %encrypted.field_type,
                    "Encrypted value does not match the column's field type, passing through"
                );
                continue;
            }
            let plaintext = self.decrypt_phi(&encrypted, user_id, record_id, client_ip)?;
            out.insert(name.to_string(), Value::String(plaintext));
        }
        Ok(out)
    }

    pub fn rotate_key(&self) -> Result<RotationOutcome> {
        let (old, new_key) = self.keys.rotate_key()?;
        Ok(RotationOutcome {
            old_key_id: old.map(|k| k.key_id),
            new_key_id: new_key.key_id,
            rotation_count: new_key.rotation_count,
            rotated_at: new_key.created_at,
        })
    }

    /// Re-seal `encrypted` under the active key.
    ///
    /// The decryption is audited under [`REENCRYPT_PRINCIPAL`] and does not
    /// count against any caller's rate limit.
    pub fn re_encrypt_with_new_key(&self, encrypted: &EncryptedValue) -> Result<EncryptedValue> {
        let active = self.keys.get_active_key()?;
        if encrypted.key_id == active.key_id && encrypted.version == ENCRYPTION_VERSION {
            return Ok(encrypted.clone());
        }

        let plaintext = zeroize::Zeroizing::new(self.decrypt_audited(
            encrypted,
            REENCRYPT_PRINCIPAL,
            None,
            None,
            false,
        )?);
        let value = self.encrypt_phi(&plaintext, encrypted.field_type)?;

        debug!(
            from_key = %encrypted.key_id,
            to_key = %value.key_id,
            "PHI field re-encrypted"
        );
        Ok(value)
    }

    pub fn needs_rotation(&self) -> bool {
        self.keys.needs_rotation()
    }

    pub fn get_key_status(&self) -> KeyStatus {
        self.keys.key_status()
    }

    pub fn list_keys(&self) -> Vec<KeyMetadata> {
        self.keys.list_keys()
    }

    pub fn get_rate_limit_stats(&self, user_id: &str) -> RateLimitStats {
        self.limiter.stats(user_id)
    }

    pub fn get_audit_stats(&self, hours: u32) -> AuditStats {
        self.audit.get_stats(hours)
    }

    pub fn audit_log(&self) -> &DecryptionAuditLog {
        &self.audit
    }

    pub fn rate_limiter(&self) -> &DecryptionRateLimiter {
        &self.limiter
    }
}
