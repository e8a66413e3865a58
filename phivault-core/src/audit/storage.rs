//! Audit Sinks
//!
//! Durable destinations for decryption audit entries.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use super::entry::DecryptionAuditEntry;
use crate::error::{PhiError, Result};

/// Append-only destination for audit entries
pub trait AuditSink: Send + Sync {
    /// Durably append one entry
    fn append(&self, entry: &DecryptionAuditEntry) -> Result<()>;
}

/// JSON-lines file sink. One record per line; the file is only ever appended
/// to, rotation and archival belong to external log tooling.
pub struct FileAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileAuditSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(&path)
            .map_err(|e| PhiError::Audit(format!("Failed to open {}: {}", path.display(), e)))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every entry in the file (operator tooling, tests)
    pub fn read_all(&self) -> Result<Vec<DecryptionAuditEntry>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    /// Stream the file and keep the newest `limit` entries, oldest first.
    /// Lines that do not parse (a torn final write, manual edits) are skipped.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<DecryptionAuditEntry>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut recent = VecDeque::with_capacity(limit.min(1024));
        let mut skipped = 0usize;

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DecryptionAuditEntry>(&line) {
                Ok(entry) => {
                    if limit == 0 {
                        continue;
                    }
                    if recent.len() >= limit {
                        recent.pop_front();
                    }
                    recent.push_back(entry);
                }
                Err(e) => {
                    skipped += 1;
                    warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %e,
                        "Skipping unreadable audit line"
                    );
                }
            }
        }

        if skipped > 0 {
            warn!(path = %self.path.display(), skipped, "Audit file had unreadable lines");
        }
        Ok(recent.into())
    }
}

impl AuditSink for FileAuditSink {
    fn append(&self, entry: &DecryptionAuditEntry) -> Result<()> {
        let mut line = entry.to_json()?;
        line.push('\n');

        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| PhiError::Audit(format!("Failed to append to {}: {}", self.path.display(), e)))
    }
}

/// In-memory sink (for testing)
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    entries: Arc<Mutex<Vec<DecryptionAuditEntry>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DecryptionAuditEntry> {
        self.entries.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &DecryptionAuditEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Discards entries; the in-memory ring is then the only record
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn append(&self, _entry: &DecryptionAuditEntry) -> Result<()> {
        Ok(())
    }
}
