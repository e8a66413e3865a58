//! Key material persistence
//!
//! [`KeyStore`] is the only seam through which secrets reach durable storage.
//! The file implementation writes every change to a temporary file in the
//! target directory, syncs it and renames it over the old file, so readers see
//! either the previous key set or the new one. Read-modify-write cycles go
//! through [`KeyStore::update_keys`], which the file store serialises across
//! processes with an advisory lock on a sidecar `.lock` file.

use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use zeroize::Zeroizing;

use super::types::KeyFile;
use crate::error::{PhiError, Result};

/// Storage backend for encryption keys and the search-token secret
pub trait KeyStore: Send + Sync {
    /// Load the key file, `None` if nothing has been persisted yet
    fn load_keys(&self) -> Result<Option<KeyFile>>;

    /// Replace the persisted key file atomically
    fn save_keys(&self, keys: &KeyFile) -> Result<()>;

    /// Load the current key file, let `apply` build its replacement, save it.
    ///
    /// Nothing is written when `apply` fails. Implementations shared between
    /// processes must hold a lock across the whole cycle.
    fn update_keys(&self, apply: &mut dyn FnMut(Option<KeyFile>) -> Result<KeyFile>) -> Result<()> {
        let next = apply(self.load_keys()?)?;
        self.save_keys(&next)
    }

    /// Load the raw HMAC secret, `None` if it was never generated
    fn load_search_secret(&self) -> Result<Option<Zeroizing<Vec<u8>>>>;

    /// Replace the HMAC secret atomically
    fn save_search_secret(&self, secret: &[u8]) -> Result<()>;
}

/// File-backed store: a JSON key file plus a raw-byte secret file, both owner-only
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    key_file: PathBuf,
    search_secret_file: PathBuf,
}

impl FileKeyStore {
    pub fn new(key_file: impl Into<PathBuf>, search_secret_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
            search_secret_file: search_secret_file.into(),
        }
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    pub fn search_secret_file(&self) -> &Path {
        &self.search_secret_file
    }

    /// Sidecar file whose advisory lock guards key-file updates
    pub fn lock_file(&self) -> PathBuf {
        let mut name = self.key_file.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn lock_exclusive(&self) -> Result<fs::File> {
        let path = self.lock_file();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                PhiError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| PhiError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| PhiError::Storage(format!("Failed to lock {}: {}", path.display(), e)))?;
        Ok(file)
    }

    fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PhiError::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Write `contents` to `path` via temp file + rename. The temp file lives in
/// the same directory so the rename never crosses filesystems.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| {
        PhiError::Storage(format!("Failed to create {}: {}", dir.display(), e))
    })?;

    let mut tmp = NamedTempFile::new_in(&dir)
        .map_err(|e| PhiError::Storage(format!("Failed to create temp file: {}", e)))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PhiError::Storage(format!("Failed to write temp file: {}", e)))?;

    restrict_to_owner(tmp.path())?;

    tmp.persist(path).map_err(|e| {
        PhiError::Storage(format!("Failed to replace {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
        PhiError::Storage(format!("Failed to restrict {}: {}", path.display(), e))
    })
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

impl KeyStore for FileKeyStore {
    fn load_keys(&self) -> Result<Option<KeyFile>> {
        let Some(bytes) = Self::read_if_exists(&self.key_file)? else {
            return Ok(None);
        };
        let bytes = Zeroizing::new(bytes);
        let file: KeyFile = serde_json::from_slice(&bytes).map_err(|e| {
            PhiError::Storage(format!(
                "Failed to parse key file {}: {}",
                self.key_file.display(),
                e
            ))
        })?;
        debug!(keys = file.keys.len(), "Loaded key file");
        Ok(Some(file))
    }

    fn save_keys(&self, keys: &KeyFile) -> Result<()> {
        let json = Zeroizing::new(serde_json::to_vec_pretty(keys)?);
        atomic_write(&self.key_file, &json)?;
        debug!(keys = keys.keys.len(), path = %self.key_file.display(), "Persisted key file");
        Ok(())
    }

    fn update_keys(&self, apply: &mut dyn FnMut(Option<KeyFile>) -> Result<KeyFile>) -> Result<()> {
        // Released when the handle is dropped
        let _lock = self.lock_exclusive()?;
        let next = apply(self.load_keys()?)?;
        self.save_keys(&next)
    }

    fn load_search_secret(&self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(Self::read_if_exists(&self.search_secret_file)?.map(Zeroizing::new))
    }

    fn save_search_secret(&self, secret: &[u8]) -> Result<()> {
        atomic_write(&self.search_secret_file, secret)
    }
}

/// In-process store for tests and embedded use
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<Option<KeyFile>>,
    search_secret: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_keys(&self) -> Result<Option<KeyFile>> {
        Ok(self.keys.lock().clone())
    }

    fn save_keys(&self, keys: &KeyFile) -> Result<()> {
        *self.keys.lock() = Some(keys.clone());
        Ok(())
    }

    fn update_keys(&self, apply: &mut dyn FnMut(Option<KeyFile>) -> Result<KeyFile>) -> Result<()> {
        let mut keys = self.keys.lock();
        let next = apply(keys.clone())?;
        *keys = Some(next);
        Ok(())
    }

    fn load_search_secret(&self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(self.search_secret.lock().clone())
    }

    fn save_search_secret(&self, secret: &[u8]) -> Result<()> {
        *self.search_secret.lock() = Some(Zeroizing::new(secret.to_vec()));
        Ok(())
    }
}
