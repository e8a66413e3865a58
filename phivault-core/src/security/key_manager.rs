use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::key_store::KeyStore;
use super::types::{EncryptionKey, KeyFile, KeyMetadata, KeyStatus, StoredKey};
use crate::error::{PhiError, Result};

/// Configuration for key lifetime and rotation warnings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub validity_days: u32,
    pub rotation_warning_days: u32,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            validity_days: 90,        // Keys expire after 90 days
            rotation_warning_days: 7, // Flag for rotation a week before expiry
        }
    }
}

/// In-memory key set. Only ever replaced wholesale, after a successful persist or a reload.
#[derive(Debug, Clone, Default)]
struct KeyRing {
    keys: BTreeMap<String, EncryptionKey>,
    active_key_id: Option<String>,
}

impl KeyRing {
    fn from_file(file: KeyFile) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for (key_id, stored) in file.keys {
            let mut key = stored.to_key()?;
            let should_be_active = file.active_key_id.as_deref() == Some(key_id.as_str());
            if key.is_active != should_be_active {
                warn!(key_id = %key_id, "Key active flag disagrees with active_key_id, correcting");
                key.is_active = should_be_active;
            }
            keys.insert(key_id, key);
        }

        let active_key_id = match file.active_key_id {
            Some(id) if keys.contains_key(&id) => Some(id),
            Some(id) => {
                return Err(PhiError::Storage(format!(
                    "Key file names missing active key {}",
                    id
                )))
            }
            None => None,
        };

        Ok(Self { keys, active_key_id })
    }

    fn to_file(&self) -> KeyFile {
        KeyFile {
            keys: self
                .keys
                .iter()
                .map(|(id, key)| (id.clone(), StoredKey::from(key)))
                .collect(),
            active_key_id: self.active_key_id.clone(),
            last_updated: Utc::now(),
        }
    }

    fn active(&self) -> Option<&EncryptionKey> {
        self.active_key_id.as_ref().and_then(|id| self.keys.get(id))
    }

    /// Union of this ring and the stored key set. No key is ever dropped. The
    /// stored active key wins, since the store holds the latest committed state.
    fn merged_with(&self, stored: Option<KeyFile>) -> Result<Self> {
        let mut merged = self.clone();
        if let Some(file) = stored {
            let stored = KeyRing::from_file(file)?;
            for (key_id, key) in stored.keys {
                merged.keys.entry(key_id).or_insert(key);
            }
            if stored.active_key_id.is_some() {
                merged.active_key_id = stored.active_key_id;
            }
        }
        for (key_id, key) in merged.keys.iter_mut() {
            key.is_active = merged.active_key_id.as_deref() == Some(key_id.as_str());
        }
        Ok(merged)
    }

    /// Copy of this ring with the current key retired and a new one active
    fn rotated(&self, policy: &KeyPolicy) -> (Self, Option<EncryptionKey>, EncryptionKey) {
        let mut next = self.clone();

        let old = next.active_key_id.take().and_then(|id| next.keys.get_mut(&id)).map(|key| {
            key.is_active = false;
            key.clone()
        });

        let rotation_count = old.as_ref().map(|k| k.rotation_count + 1).unwrap_or(0);
        let mut new_key = EncryptionKey::generate(policy.validity_days, rotation_count);
        new_key.is_active = true;

        next.active_key_id = Some(new_key.key_id.clone());
        next.keys.insert(new_key.key_id.clone(), new_key.clone());

        (next, old, new_key)
    }
}

/// Owns key generation, active-key selection and rotation
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    policy: KeyPolicy,
    ring: RwLock<KeyRing>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("store", &"[KEY_STORE]")
            .field("policy", &self.policy)
            .field("ring", &"[REDACTED_KEYS]")
            .finish()
    }
}

impl KeyManager {
    /// Create a key manager and load whatever the store already holds.
    /// No key is generated here; the first `get_active_key` does that.
    pub fn new(store: Arc<dyn KeyStore>, policy: KeyPolicy) -> Result<Self> {
        let ring = match store.load_keys()? {
            Some(file) => KeyRing::from_file(file)?,
            None => KeyRing::default(),
        };
        info!(
            keys = ring.keys.len(),
            active = ring.active_key_id.is_some(),
            "Key manager initialised"
        );

        Ok(Self {
            store,
            policy,
            ring: RwLock::new(ring),
        })
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Generate a standalone, inactive key. Not added to the ring.
    pub fn generate_key(&self) -> EncryptionKey {
        EncryptionKey::generate(self.policy.validity_days, 0)
    }

    /// Current encryption key, generating one if none is active or it expired
    pub fn get_active_key(&self) -> Result<EncryptionKey> {
        {
            let ring = self.ring.read();
            if let Some(key) = ring.active().filter(|k| !k.is_expired()) {
                return Ok(key.clone());
            }
        }

        let mut ring = self.ring.write();
        // Another caller may have rotated while we waited for the write lock
        if let Some(key) = ring.active().filter(|k| !k.is_expired()) {
            return Ok(key.clone());
        }

        let policy = &self.policy;
        let (old, new_key, adopted) = self.commit(&mut ring, |merged| {
            // Or another process, in which case its key is taken as is
            if let Some(key) = merged.active().filter(|k| !k.is_expired()).cloned() {
                return (merged, (None, key, true));
            }
            let (next, old, new_key) = merged.rotated(policy);
            (next, (old, new_key, false))
        })?;

        match old {
            _ if adopted => info!(key_id = %new_key.key_id, "Adopted active key from key store"),
            Some(old) => warn!(
                old_key_id = %old.key_id,
                new_key_id = %new_key.key_id,
                "Active key expired, rotated automatically"
            ),
            None => info!(key_id = %new_key.key_id, "Generated initial encryption key"),
        }
        Ok(new_key)
    }

    /// Look up any key, active or retired. An unknown id triggers one reload
    /// of the store so keys written by other processes resolve.
    pub fn get_key(&self, key_id: &str) -> Option<EncryptionKey> {
        {
            let ring = self.ring.read();
            if let Some(key) = ring.keys.get(key_id) {
                return Some(key.clone());
            }
        }

        match self.reload() {
            Ok(()) => self.ring.read().keys.get(key_id).cloned(),
            Err(e) => {
                warn!(key_id, error = %e, "Failed to reload key set");
                None
            }
        }
    }

    /// Merge keys persisted since this manager loaded into the ring. Nothing is written.
    pub fn reload(&self) -> Result<()> {
        let stored = self.store.load_keys()?;
        let mut ring = self.ring.write();
        let merged = ring.merged_with(stored)?;
        *ring = merged;
        Ok(())
    }

    /// Retire the active key and activate a new one.
    ///
    /// Returns `(old, new)`. The store is written before the in-memory ring
    /// changes; if the write fails the rotation did not happen. `old` is the
    /// key that was active in the store, which may belong to another process.
    pub fn rotate_key(&self) -> Result<(Option<EncryptionKey>, EncryptionKey)> {
        let mut ring = self.ring.write();
        let policy = &self.policy;
        let (old, new_key) = self.commit(&mut ring, |merged| {
            let (next, old, new_key) = merged.rotated(policy);
            (next, (old, new_key))
        })?;

        info!(
            old_key_id = old.as_ref().map(|k| k.key_id.as_str()).unwrap_or("none"),
            new_key_id = %new_key.key_id,
            rotation_count = new_key.rotation_count,
            "Encryption key rotated"
        );
        Ok((old, new_key))
    }

    /// True when no key is active or the active key expires within the warning window
    pub fn needs_rotation(&self) -> bool {
        let ring = self.ring.read();
        match ring.active() {
            Some(key) => ChronoDuration::try_days(self.policy.rotation_warning_days as i64)
                .and_then(|warning| key.expires_at.checked_sub_signed(warning))
                .map_or(true, |warn_at| Utc::now() >= warn_at),
            None => true,
        }
    }

    /// Key metadata, newest first. Key material is never included.
    pub fn list_keys(&self) -> Vec<KeyMetadata> {
        let mut keys: Vec<KeyMetadata> = self.ring.read().keys.values().map(|k| k.metadata()).collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        keys
    }

    pub fn key_status(&self) -> KeyStatus {
        let needs_rotation = self.needs_rotation();
        let ring = self.ring.read();
        let active = ring.active();
        KeyStatus {
            active_key_id: active.map(|k| k.key_id.clone()),
            active_created_at: active.map(|k| k.created_at),
            active_expires_at: active.map(|k| k.expires_at),
            days_until_expiry: active.map(|k| (k.expires_at - Utc::now()).num_days()),
            rotation_count: active.map(|k| k.rotation_count).unwrap_or(0),
            total_keys: ring.keys.len(),
            retired_keys: ring.keys.values().filter(|k| !k.is_active).count(),
            needs_rotation,
        }
    }

    /// Merge the stored key set into `ring`, derive the next ring from the
    /// merge, persist it and swap it in. The store's update lock is held for
    /// the load and the write, and `ring` only changes if the write succeeded.
    fn commit<T>(&self, ring: &mut KeyRing, change: impl FnOnce(KeyRing) -> (KeyRing, T)) -> Result<T> {
        let mut change = Some(change);
        let mut committed = None;

        self.store
            .update_keys(&mut |stored| {
                let change = change
                    .take()
                    .ok_or_else(|| PhiError::KeyRotation("Key update applied twice".to_string()))?;
                let (next, value) = change(ring.merged_with(stored)?);
                let file = next.to_file();
                committed = Some((next, value));
                Ok(file)
            })
            .map_err(|e| {
                warn!(error = %e, "Failed to persist key set");
                match e {
                    PhiError::KeyRotation(_) => e,
                    other => PhiError::KeyRotation(other.to_string()),
                }
            })?;

        let (next, value) = committed
            .ok_or_else(|| PhiError::KeyRotation("Key store skipped the update".to_string()))?;
        *ring = next;
        Ok(value)
    }
}
