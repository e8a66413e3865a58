//! Decryption Audit Logging
//!
//! Every decryption attempt, successful or not, produces exactly one
//! [`DecryptionAuditEntry`]. Entries go to a bounded in-memory ring for
//! recent-activity queries and to an append-only sink for the durable trail.

pub mod entry;
pub mod log;
pub mod storage;

pub use entry::{AuditStats, DecryptionAuditEntry, UserActivity};
pub use log::{DecryptionAuditLog, DEFAULT_BUFFER_SIZE};
pub use storage::{AuditSink, FileAuditSink, MemoryAuditSink, NullAuditSink};
