//! Key rotation watcher
//!
//! Periodically asks the service whether the active key is inside its
//! rotation warning window and rotates when it is.

use phivault_core::{PhiEncryptionService, RotationOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct RotationWatcher {
    service: Arc<PhiEncryptionService>,
    interval: Duration,
}

impl RotationWatcher {
    pub fn new(service: Arc<PhiEncryptionService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    /// Rotate if due. Returns the outcome when a rotation happened.
    pub fn check_once(&self) -> phivault_core::Result<Option<RotationOutcome>> {
        rotate_if_due(&self.service)
    }

    /// Run until `shutdown` resolves. Returns the number of rotations performed.
    ///
    /// A failed rotation is logged and retried on the next tick; the store
    /// is unchanged after a failure, so there is nothing to roll back.
    pub async fn run<F>(&self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut rotations = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(rotations, "Rotation watcher stopping");
                    return rotations;
                }
                _ = interval.tick() => {
                    let service = Arc::clone(&self.service);
                    match tokio::task::spawn_blocking(move || rotate_if_due(&service)).await {
                        Ok(Ok(Some(_))) => rotations += 1,
                        Ok(Ok(None)) => {}
                        Ok(Err(e)) => error!(error = %e, "Scheduled key rotation failed"),
                        Err(e) => error!(error = %e, "Rotation check panicked"),
                    }
                }
            }
        }
    }
}

fn rotate_if_due(service: &PhiEncryptionService) -> phivault_core::Result<Option<RotationOutcome>> {
    if !service.needs_rotation() {
        debug!("Active key is not due for rotation");
        return Ok(None);
    }

    let outcome = service.rotate_key()?;
    info!(
        old_key_id = outcome.old_key_id.as_deref().unwrap_or("none"),
        new_key_id = %outcome.new_key_id,
        "Scheduled key rotation completed"
    );
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use phivault_core::audit::NullAuditSink;
    use phivault_core::{KeyPolicy, MemoryKeyStore, PhiFieldType, RateLimitConfig};

    fn service(policy: KeyPolicy) -> Arc<PhiEncryptionService> {
        Arc::new(
            PhiEncryptionService::with_store(
                Arc::new(MemoryKeyStore::new()),
                policy,
                RateLimitConfig::default(),
                Box::new(NullAuditSink),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_fresh_key_is_left_alone() {
        let svc = service(KeyPolicy::default());
        svc.encrypt_phi("x", PhiFieldType::Phone).unwrap();

        let watcher = RotationWatcher::new(Arc::clone(&svc), Duration::from_secs(60));
        assert!(watcher.check_once().unwrap().is_none());
        assert_eq!(svc.list_keys().len(), 1);
    }

    #[test]
    fn test_missing_key_triggers_rotation() {
        let svc = service(KeyPolicy::default());
        let watcher = RotationWatcher::new(Arc::clone(&svc), Duration::from_secs(60));

        let outcome = watcher.check_once().unwrap().unwrap();
        assert!(outcome.old_key_id.is_none());
        assert_eq!(svc.get_key_status().active_key_id, Some(outcome.new_key_id));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let svc = service(KeyPolicy::default());
        let watcher = RotationWatcher::new(svc, Duration::from_millis(10));

        let rotations = watcher
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await;
        // Only the first tick finds the ring empty
        assert_eq!(rotations, 1);
    }
}
