use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use phivault_core::audit::{FileAuditSink, MemoryAuditSink};
use phivault_core::security::MemoryKeyStore;
use phivault_core::{
    AuditSink, DecryptionAuditEntry, EncryptedValue, KeyPolicy, PhiConfig, PhiEncryptionService, PhiError, PhiFieldType,
    RateLimitConfig, SensitivityTier,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn service_with(limits: RateLimitConfig, sink: MemoryAuditSink) -> PhiEncryptionService {
    PhiEncryptionService::with_store(
        Arc::new(MemoryKeyStore::new()),
        KeyPolicy::default(),
        limits,
        Box::new(sink),
    )
    .unwrap()
}

/// Sink that accepts failure entries but rejects successes, like a disk that
/// fills up between two writes
struct RejectingSuccessSink;

impl AuditSink for RejectingSuccessSink {
    fn append(&self, entry: &DecryptionAuditEntry) -> phivault_core::Result<()> {
        if entry.success {
            return Err(PhiError::Audit("no space left on device".to_string()));
        }
        Ok(())
    }
}

fn burst_limited(limit: u32) -> RateLimitConfig {
    RateLimitConfig {
        burst_window: Duration::from_secs(5),
        burst_limit: limit,
        ..Default::default()
    }
}

#[test]
fn test_every_field_type_round_trips() {
    let svc = service_with(RateLimitConfig::default(), MemoryAuditSink::new());

    for field_type in PhiFieldType::ALL {
        let plaintext = format!("sample {} value", field_type);
        let encrypted = svc.encrypt_phi(&plaintext, field_type).unwrap();
        let decrypted = svc.decrypt_phi(&encrypted, "auditor", None, None).unwrap();
        assert_eq!(decrypted, plaintext, "field type {}", field_type);
    }
}

#[test]
fn test_values_survive_rotation() {
    let svc = service_with(RateLimitConfig::default(), MemoryAuditSink::new());
    let before = svc.encrypt_phi("Jane Doe", PhiFieldType::PatientName).unwrap();

    for _ in 0..3 {
        svc.rotate_key().unwrap();
    }
    let after = svc.encrypt_phi("John Roe", PhiFieldType::PatientName).unwrap();

    assert_ne!(before.key_id, after.key_id);
    assert_eq!(svc.decrypt_phi(&before, "u1", None, None).unwrap(), "Jane Doe");
    assert_eq!(svc.decrypt_phi(&after, "u1", None, None).unwrap(), "John Roe");

    let active: Vec<_> = svc.list_keys().into_iter().filter(|k| k.is_active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(Some(active[0].key_id.clone()), svc.get_key_status().active_key_id);
}

#[test]
fn test_any_flipped_byte_fails_decryption() {
    let sink = MemoryAuditSink::new();
    let svc = service_with(RateLimitConfig::default(), sink.clone());
    let original = svc.encrypt_phi("123-45-6789", PhiFieldType::Ssn).unwrap();
    let raw = URL_SAFE.decode(&original.ciphertext).unwrap();

    for index in 0..raw.len() {
        let mut tampered_bytes = raw.clone();
        tampered_bytes[index] ^= 0x01;
        let tampered = EncryptedValue {
            ciphertext: URL_SAFE.encode(&tampered_bytes),
            ..original.clone()
        };

        let result = svc.decrypt_phi(&tampered, "u1", None, None);
        assert!(
            matches!(result, Err(PhiError::Decryption(_))),
            "byte {} was not detected",
            index
        );
    }

    assert_eq!(sink.entries().len(), raw.len());
    assert!(sink.entries().iter().all(|e| !e.success));
}

#[test]
fn test_fourth_burst_decryption_is_denied_and_audited() {
    let sink = MemoryAuditSink::new();
    let svc = service_with(burst_limited(3), sink.clone());
    let encrypted = svc.encrypt_phi("MRN-778", PhiFieldType::Mrn).unwrap();

    for _ in 0..3 {
        svc.decrypt_phi(&encrypted, "scraper", Some("rec-1"), None).unwrap();
    }
    let err = svc
        .decrypt_phi(&encrypted, "scraper", Some("rec-1"), None)
        .unwrap_err();

    match err {
        PhiError::RateLimitExceeded {
            user_id,
            window,
            limit,
        } => {
            assert_eq!(user_id, "scraper");
            assert_eq!(window, "burst");
            assert_eq!(limit, 3);
        }
        other => panic!("unexpected error: {other}"),
    }

    let entries = sink.entries();
    assert_eq!(entries.len(), 4);
    let failed: Vec<_> = entries.iter().filter(|e| !e.success).collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("rate limit"));

    let stats = svc.get_rate_limit_stats("scraper");
    assert_eq!(stats.burst_count, 3);
    assert!(stats.is_limited);
    // Other callers are unaffected
    assert!(svc.decrypt_phi(&encrypted, "clinician", None, None).is_ok());
}

#[test]
fn test_audit_has_one_entry_per_call() {
    let sink = MemoryAuditSink::new();
    let svc = service_with(burst_limited(4), sink.clone());
    let good = svc.encrypt_phi("warfarin", PhiFieldType::Medication).unwrap();
    let orphan = EncryptedValue {
        key_id: "phk_deleted".to_string(),
        ..good.clone()
    };

    let mut calls = 0;
    for i in 0..6 {
        let _ = svc.decrypt_phi(&good, "mixed", None, None);
        calls += 1;
        if i % 2 == 0 {
            let _ = svc.decrypt_phi(&orphan, "other", None, None);
            calls += 1;
        }
    }

    assert_eq!(sink.entries().len(), calls);

    let stats = svc.get_audit_stats(1);
    assert_eq!(stats.total, calls);
    assert_eq!(stats.successful, 4);
    assert_eq!(stats.failed, calls - 4);
    assert_eq!(stats.by_field_type.get("medication"), Some(&calls));
    assert_eq!(stats.top_users[0].user_id, "mixed");
}

#[test]
fn test_ssn_and_email_record_scenario() {
    let svc = service_with(RateLimitConfig::default(), MemoryAuditSink::new());

    assert_eq!(svc.get_sensitivity_tier(PhiFieldType::Ssn), SensitivityTier::Critical);
    assert_eq!(svc.get_sensitivity_tier(PhiFieldType::Ssn).level(), 1);
    assert_eq!(svc.get_sensitivity_tier(PhiFieldType::Email), SensitivityTier::High);
    assert_eq!(svc.get_sensitivity_tier(PhiFieldType::Email).level(), 2);

    let record = json!({
        "ssn": "123-45-6789",
        "email": "dr.jones@example.com",
        "ward": "4B"
    });
    let record = record.as_object().unwrap();
    let fields = [("ssn", PhiFieldType::Ssn), ("email", PhiFieldType::Email)];

    let stored = svc.encrypt_dict(record, &fields).unwrap();
    let stored_text = serde_json::to_string(&stored).unwrap();
    assert!(!stored_text.contains("123-45-6789"));
    assert!(!stored_text.contains("dr.jones@example.com"));
    assert_eq!(stored["ward"], "4B");

    let restored = svc
        .decrypt_dict(&stored, &fields, "dr.jones", Some("patient-17"), Some("10.0.0.4"))
        .unwrap();
    assert_eq!(&restored, record);
    assert_eq!(svc.get_audit_stats(24).by_user.get("dr.jones"), Some(&2));
}

#[test]
fn test_file_backed_service_reloads_from_config() {
    let dir = tempdir().unwrap();
    let config = PhiConfig::with_data_dir(dir.path());

    let (encoded, token) = {
        let svc = PhiEncryptionService::from_config(&config).unwrap();
        svc.encrypt_searchable("555-0100", PhiFieldType::Phone).unwrap()
    };

    let svc = PhiEncryptionService::from_config(&config).unwrap();
    let encrypted = EncryptedValue::decode(&encoded).unwrap();
    assert_eq!(svc.decrypt_phi(&encrypted, "u1", None, None).unwrap(), "555-0100");
    assert!(svc.verify_search_token("555-0100", &token, PhiFieldType::Phone));

    let audit = FileAuditSink::open(&config.audit.log_file).unwrap();
    let entries = audit.read_all().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].field_type, PhiFieldType::Phone);
}

#[test]
fn test_services_sharing_key_file_keep_each_others_keys() {
    let dir = tempdir().unwrap();
    let config = PhiConfig::with_data_dir(dir.path());

    // A long-running watcher and a one-shot command open the same files
    let watch = PhiEncryptionService::from_config(&config).unwrap();
    watch.rotate_key().unwrap();

    let cli = PhiEncryptionService::from_config(&config).unwrap();
    cli.rotate_key().unwrap();
    let ssn = cli.encrypt_phi("123-45-6789", PhiFieldType::Ssn).unwrap();
    drop(cli);

    let outcome = watch.rotate_key().unwrap();
    assert_eq!(outcome.old_key_id.as_deref(), Some(ssn.key_id.as_str()));
    assert_eq!(outcome.rotation_count, 2);

    let fresh = PhiEncryptionService::from_config(&config).unwrap();
    assert_eq!(fresh.get_key_status().total_keys, 3);
    assert_eq!(fresh.decrypt_phi(&ssn, "u1", None, None).unwrap(), "123-45-6789");
    // The watcher resolves the other process's key on demand too
    assert_eq!(watch.decrypt_phi(&ssn, "u1", None, None).unwrap(), "123-45-6789");
}

#[test]
fn test_audit_write_failure_withholds_plaintext() {
    let svc = PhiEncryptionService::with_store(
        Arc::new(MemoryKeyStore::new()),
        KeyPolicy::default(),
        RateLimitConfig::default(),
        Box::new(RejectingSuccessSink),
    )
    .unwrap();
    let encrypted = svc.encrypt_phi("123-45-6789", PhiFieldType::Ssn).unwrap();

    let result = svc.decrypt_phi(&encrypted, "dr.who", Some("rec-1"), None);
    match result {
        Err(PhiError::Audit(message)) => assert!(!message.contains("123-45-6789")),
        other => panic!("expected an audit error, got {:?}", other),
    }

    let stats = svc.get_audit_stats(1);
    assert_eq!(stats.total, 1);
    assert_eq!(stats.successful, 0);
    assert_eq!(stats.failed, 1);
    let kept = &svc.audit_log().recent(1)[0];
    assert!(!kept.success);
    assert_eq!(kept.record_id.as_deref(), Some("rec-1"));

    // Failure entries still land, so an unknown key reports its own error
    let mut orphan = encrypted.clone();
    orphan.key_id = "phk_missing".to_string();
    assert!(matches!(
        svc.decrypt_phi(&orphan, "dr.who", None, None),
        Err(PhiError::KeyNotFound(_))
    ));
}

#[test]
fn test_audit_stats_accept_any_window() {
    let svc = service_with(RateLimitConfig::default(), MemoryAuditSink::new());
    let encrypted = svc.encrypt_phi("Jane Doe", PhiFieldType::PatientName).unwrap();
    svc.decrypt_phi(&encrypted, "u1", None, None).unwrap();

    let stats = svc.get_audit_stats(u32::MAX);
    assert_eq!(stats.total, 1);
    assert_eq!(stats.successful, 1);
}

#[test]
fn test_torn_audit_line_keeps_the_rest_of_history() {
    let dir = tempdir().unwrap();
    let mut config = PhiConfig::with_data_dir(dir.path());
    config.audit.buffer_size = 2;

    {
        let svc = PhiEncryptionService::from_config(&config).unwrap();
        let value = svc.encrypt_phi("A1C 6.1%", PhiFieldType::Diagnosis).unwrap();
        for user in ["first", "second", "third"] {
            svc.decrypt_phi(&value, user, None, None).unwrap();
        }
    }
    // A crash mid-write leaves half a record behind
    let mut raw = std::fs::read_to_string(&config.audit.log_file).unwrap();
    raw.push_str("{\"timestamp\":\"2026-");
    std::fs::write(&config.audit.log_file, raw).unwrap();

    let svc = PhiEncryptionService::from_config(&config).unwrap();
    let users: Vec<_> = svc.audit_log().recent(10).into_iter().map(|e| e.user_id).collect();
    assert_eq!(users, vec!["third", "second"]);
}

#[test]
fn test_search_tokens_never_contain_plaintext() {
    let svc = service_with(RateLimitConfig::default(), MemoryAuditSink::new());
    let token = svc.create_search_token("Jane Doe", PhiFieldType::Mrn).unwrap();

    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(!token.to_lowercase().contains("jane"));
    assert_eq!(token, svc.create_search_token(" jane doe ", PhiFieldType::Mrn).unwrap());
    assert_ne!(
        token,
        svc.create_search_token("Jane Doe", PhiFieldType::PatientName).unwrap()
    );
}
