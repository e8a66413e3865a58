use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tracing::{error, info, warn};

use super::entry::{AuditStats, DecryptionAuditEntry, UserActivity};
use super::storage::AuditSink;
use crate::error::{PhiError, Result};

pub const DEFAULT_BUFFER_SIZE: usize = 10_000;
const TOP_USERS: usize = 10;

/// Ring buffer of recent decryptions backed by a durable sink
pub struct DecryptionAuditLog {
    buffer: Mutex<VecDeque<DecryptionAuditEntry>>,
    capacity: usize,
    sink: Box<dyn AuditSink>,
}

impl DecryptionAuditLog {
    pub fn new(sink: Box<dyn AuditSink>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_SIZE))),
            capacity,
            sink,
        }
    }

    /// Seed the ring with entries already in the durable sink. Nothing is
    /// appended or traced; only the newest `capacity` entries are kept.
    pub fn preload(&self, entries: impl IntoIterator<Item = DecryptionAuditEntry>) {
        let mut buffer = self.buffer.lock();
        for entry in entries {
            if buffer.len() >= self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(entry);
        }
    }

    /// Record one decryption attempt.
    ///
    /// The durable append happens first and an `Err` means it failed, so
    /// callers must treat the decryption as failed. The entry still lands in
    /// the ring, but a success that could not be made durable is kept as a
    /// failure so statistics never count it.
    pub fn log_decryption(&self, mut entry: DecryptionAuditEntry) -> Result<()> {
        Self::trace_entry(&entry);

        let appended = self.sink.append(&entry).map_err(|e| {
            error!(
                target: "phi_audit",
                user_id = %entry.user_id,
                error = %e,
                "Failed to write durable audit entry"
            );
            PhiError::Audit(e.to_string())
        });

        if let Err(e) = &appended {
            if entry.success {
                entry.success = false;
                entry.error_message = Some(format!("audit_write_failed: {}", e));
            }
        }

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(entry);
        appended
    }

    fn trace_entry(entry: &DecryptionAuditEntry) {
        if entry.success {
            info!(
                target: "phi_audit",
                user_id = %entry.user_id,
                field_type = %entry.field_type,
                key_id = %entry.key_id,
                record_id = entry.record_id.as_deref().unwrap_or("-"),
                "PHI decrypted"
            );
        } else {
            warn!(
                target: "phi_audit",
                user_id = %entry.user_id,
                field_type = %entry.field_type,
                key_id = %entry.key_id,
                record_id = entry.record_id.as_deref().unwrap_or("-"),
                client_ip = entry.client_ip.as_deref().unwrap_or("-"),
                error = entry.error_message.as_deref().unwrap_or("unknown"),
                "PHI decryption failed"
            );
        }
    }

    /// Aggregate the entries from the last `hours` hours
    pub fn get_stats(&self, hours: u32) -> AuditStats {
        // A window reaching past the representable range covers everything
        let cutoff = ChronoDuration::try_hours(hours as i64)
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let buffer = self.buffer.lock();

        let mut stats = AuditStats {
            hours,
            total: 0,
            successful: 0,
            failed: 0,
            by_user: BTreeMap::new(),
            by_field_type: BTreeMap::new(),
            top_users: Vec::new(),
        };

        let window = buffer
            .iter()
            .filter(|e| cutoff.map_or(true, |cutoff| e.timestamp >= cutoff));
        for entry in window {
            stats.total += 1;
            if entry.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            *stats.by_user.entry(entry.user_id.clone()).or_insert(0) += 1;
            *stats
                .by_field_type
                .entry(entry.field_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        let mut ranked: Vec<UserActivity> = stats
            .by_user
            .iter()
            .map(|(user_id, &decryptions)| UserActivity {
                user_id: user_id.clone(),
                decryptions,
            })
            .collect();
        ranked.sort_by(|a, b| b.decryptions.cmp(&a.decryptions).then_with(|| a.user_id.cmp(&b.user_id)));
        ranked.truncate(TOP_USERS);
        stats.top_users = ranked;

        stats
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<DecryptionAuditEntry> {
        self.buffer.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn entries_for_user(&self, user_id: &str, limit: usize) -> Vec<DecryptionAuditEntry> {
        self.buffer
            .lock()
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entries currently held in memory
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::storage::{MemoryAuditSink, NullAuditSink};
    use crate::fields::PhiFieldType;
    use pretty_assertions::assert_eq;

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn append(&self, _entry: &DecryptionAuditEntry) -> Result<()> {
            Err(PhiError::Audit("read-only filesystem".to_string()))
        }
    }

    fn ok(user: &str, field: PhiFieldType) -> DecryptionAuditEntry {
        DecryptionAuditEntry::success(user, field, "phk_a", None, None)
    }

    fn failed(user: &str, field: PhiFieldType) -> DecryptionAuditEntry {
        DecryptionAuditEntry::failure(user, field, "phk_a", None, None, "decryption_failed")
    }

    #[test]
    fn test_entries_reach_sink_and_ring() {
        let sink = MemoryAuditSink::new();
        let log = DecryptionAuditLog::new(Box::new(sink.clone()), 100);

        log.log_decryption(ok("u1", PhiFieldType::Ssn)).unwrap();
        log.log_decryption(failed("u2", PhiFieldType::Email)).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(sink.entries().len(), 2);
        assert_eq!(log.recent(1)[0].user_id, "u2");
    }

    #[test]
    fn test_ring_is_bounded() {
        let log = DecryptionAuditLog::new(Box::new(NullAuditSink), 3);
        for i in 0..5 {
            log.log_decryption(ok(&format!("user{}", i), PhiFieldType::Mrn)).unwrap();
        }
        assert_eq!(log.len(), 3);
        let users: Vec<_> = log.recent(10).into_iter().map(|e| e.user_id).collect();
        assert_eq!(users, vec!["user4", "user3", "user2"]);
    }

    #[test]
    fn test_stats_aggregation() {
        let log = DecryptionAuditLog::new(Box::new(NullAuditSink), 100);
        log.log_decryption(ok("alice", PhiFieldType::Ssn)).unwrap();
        log.log_decryption(ok("alice", PhiFieldType::Email)).unwrap();
        log.log_decryption(failed("alice", PhiFieldType::Ssn)).unwrap();
        log.log_decryption(ok("bob", PhiFieldType::Ssn)).unwrap();

        let stats = log.get_stats(24);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_user.get("alice"), Some(&3));
        assert_eq!(stats.by_field_type.get("ssn"), Some(&3));
        assert_eq!(
            stats.top_users,
            vec![
                UserActivity { user_id: "alice".into(), decryptions: 3 },
                UserActivity { user_id: "bob".into(), decryptions: 1 },
            ]
        );
    }

    #[test]
    fn test_stats_window_excludes_old_entries() {
        let log = DecryptionAuditLog::new(Box::new(NullAuditSink), 100);
        let mut old = ok("archivist", PhiFieldType::Diagnosis);
        old.timestamp = Utc::now() - ChronoDuration::hours(30);
        log.log_decryption(old).unwrap();
        log.log_decryption(ok("clinician", PhiFieldType::Diagnosis)).unwrap();

        assert_eq!(log.get_stats(24).total, 1);
        assert_eq!(log.get_stats(48).total, 2);
    }

    #[test]
    fn test_sink_failure_is_reported_but_buffered() {
        let log = DecryptionAuditLog::new(Box::new(BrokenSink), 10);
        let result = log.log_decryption(ok("u1", PhiFieldType::Phone));
        assert!(matches!(result, Err(PhiError::Audit(_))));
        assert_eq!(log.len(), 1);

        let kept = &log.recent(1)[0];
        assert!(!kept.success);
        assert!(kept.error_message.as_deref().unwrap().starts_with("audit_write_failed"));
        let stats = log.get_stats(1);
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_failed_entry_keeps_its_error_when_sink_fails() {
        let log = DecryptionAuditLog::new(Box::new(BrokenSink), 10);
        assert!(log.log_decryption(failed("u1", PhiFieldType::Phone)).is_err());
        assert_eq!(log.recent(1)[0].error_message.as_deref(), Some("decryption_failed"));
    }

    #[test]
    fn test_stats_over_unbounded_window() {
        let log = DecryptionAuditLog::new(Box::new(NullAuditSink), 10);
        let mut ancient = ok("archivist", PhiFieldType::Mrn);
        ancient.timestamp = Utc::now() - ChronoDuration::days(365 * 40);
        log.log_decryption(ancient).unwrap();
        log.log_decryption(failed("clinician", PhiFieldType::Mrn)).unwrap();

        let stats = log.get_stats(u32::MAX);
        assert_eq!(stats.hours, u32::MAX);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 1);
    }

    #[test]
    fn test_preload_respects_capacity() {
        let sink = MemoryAuditSink::new();
        let log = DecryptionAuditLog::new(Box::new(sink.clone()), 2);
        log.preload(vec![
            ok("old", PhiFieldType::Ssn),
            ok("mid", PhiFieldType::Ssn),
            failed("new", PhiFieldType::Ssn),
        ]);

        assert_eq!(log.len(), 2);
        assert_eq!(log.recent(1)[0].user_id, "new");
        assert!(sink.entries().is_empty());
        assert_eq!(log.get_stats(1).failed, 1);
    }

    #[test]
    fn test_entries_for_user() {
        let log = DecryptionAuditLog::new(Box::new(NullAuditSink), 10);
        log.log_decryption(ok("a", PhiFieldType::Address)).unwrap();
        log.log_decryption(ok("b", PhiFieldType::Address)).unwrap();
        log.log_decryption(failed("a", PhiFieldType::Address)).unwrap();

        let entries = log.entries_for_user("a", 10);
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].success);
    }
}
