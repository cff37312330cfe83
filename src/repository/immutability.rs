use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::repository::ImmutabilityPolicy;

use super::{BackupFileMeta, BackupImageSpec, RepositoryBackend, RepositoryError, StorageInfo};

/// Decorator around any [`RepositoryBackend`] enforcing minimum retention
/// and post-grace-period immutability flags.
///
/// Keeping enforcement here means neither the chain manager nor the
/// workflow engine ever sees retention rules; they operate on the same
/// capability set regardless of policy.
pub struct ImmutabilityGuard {
    inner: Arc<dyn RepositoryBackend>,
    policy: ImmutabilityPolicy,
}

impl ImmutabilityGuard {
    pub fn new(inner: Arc<dyn RepositoryBackend>, policy: ImmutabilityPolicy) -> Self {
        Self { inner, policy }
    }

    fn qualifies(&self, backup_type: &str) -> bool {
        policy_applies(&self.policy, backup_type)
    }
}

/// Apply the immutability flag to every qualifying backup older than the
/// grace period that is not flagged yet. Per-file errors are logged and the
/// sweep continues.
///
/// Flag application is pure lsattr/chattr on paths, so the sweep needs only
/// the policy and the backup metadata, not a backend.
pub async fn sweep_flags(policy: &ImmutabilityPolicy, backups: &[BackupFileMeta]) {
    let now = Utc::now();
    for meta in backups {
        if !policy_applies(policy, &meta.backup_type) {
            continue;
        }
        if now - meta.created_at < Duration::days(policy.grace_period_days) {
            continue;
        }
        match is_immutable(&meta.image_path).await {
            Ok(true) => continue,
            Ok(false) => {
                if let Err(e) = set_immutable(&meta.image_path, true).await {
                    warn!(
                        "Immutability sweep: failed to flag {}: {}",
                        meta.image_path.display(),
                        e
                    );
                } else {
                    info!("Flagged {} immutable", meta.image_path.display());
                }
            }
            Err(e) => warn!(
                "Immutability sweep: cannot inspect {}: {}",
                meta.image_path.display(),
                e
            ),
        }
    }
}

#[async_trait]
impl RepositoryBackend for ImmutabilityGuard {
    fn repository_id(&self) -> i64 {
        self.inner.repository_id()
    }

    fn image_path(&self, context_id: i64, disk_index: i64, backup_id: i64) -> PathBuf {
        self.inner.image_path(context_id, disk_index, backup_id)
    }

    async fn create_backup(&self, spec: &BackupImageSpec) -> Result<PathBuf, RepositoryError> {
        let path = self.inner.create_backup(spec).await?;

        // No grace period means the file is locked the moment it exists.
        if self.policy.grace_period_days == 0 && self.qualifies(&spec.backup_type) {
            if let Err(e) = set_immutable(&path, true).await {
                warn!(
                    "Could not apply immediate immutability to {}: {}",
                    path.display(),
                    e
                );
            }
        }

        Ok(path)
    }

    async fn delete_backup(&self, meta: &BackupFileMeta) -> Result<(), RepositoryError> {
        if let Some(locked_until) = retention_lock_expiry(&self.policy, meta, Utc::now()) {
            return Err(RepositoryError::RetentionLocked(locked_until));
        }

        let was_immutable = is_immutable(&meta.image_path).await.unwrap_or(false);
        if was_immutable {
            set_immutable(&meta.image_path, false).await?;
        }

        match self.inner.delete_backup(meta).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The file survives the failed delete, so its protection is
                // restored before the error propagates.
                if was_immutable && meta.image_path.exists() {
                    if let Err(re) = set_immutable(&meta.image_path, true).await {
                        warn!(
                            "Failed to restore immutability on {} after delete error: {}",
                            meta.image_path.display(),
                            re
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn storage_info(&self) -> Result<StorageInfo, RepositoryError> {
        self.inner.storage_info().await
    }
}

/// Whether the policy covers a backup of the given type.
pub fn policy_applies(policy: &ImmutabilityPolicy, backup_type: &str) -> bool {
    match backup_type {
        "full" => policy.apply_to_full_backups,
        "incremental" => policy.apply_to_incrementals,
        _ => false,
    }
}

/// If the backup is still inside its minimum retention window, the instant
/// the window ends; `None` once deletion is allowed.
pub fn retention_lock_expiry(
    policy: &ImmutabilityPolicy,
    meta: &BackupFileMeta,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !policy_applies(policy, &meta.backup_type) {
        return None;
    }
    let unlock_at = meta.created_at + Duration::days(policy.min_retention_days);
    if now < unlock_at {
        Some(unlock_at)
    } else {
        None
    }
}

/// Read the ext immutable attribute via lsattr(1).
async fn is_immutable(path: &Path) -> Result<bool, RepositoryError> {
    let output = tokio::process::Command::new("lsattr")
        .arg("-d")
        .arg(path)
        .output()
        .await?;
    if !output.status.success() {
        return Err(RepositoryError::Mount(format!(
            "lsattr failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .split_whitespace()
        .next()
        .map_or(false, |flags| flags.contains('i')))
}

/// Set or clear the OS-level immutable attribute via chattr(1).
async fn set_immutable(path: &Path, immutable: bool) -> Result<(), RepositoryError> {
    let flag = if immutable { "+i" } else { "-i" };
    let output = tokio::process::Command::new("chattr")
        .arg(flag)
        .arg(path)
        .output()
        .await?;
    if !output.status.success() {
        return Err(RepositoryError::Mount(format!(
            "chattr {} failed for {}: {}",
            flag,
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ImmutabilityPolicy {
        ImmutabilityPolicy {
            min_retention_days: 7,
            grace_period_days: 1,
            apply_to_full_backups: true,
            apply_to_incrementals: false,
        }
    }

    fn meta(backup_type: &str, age_days: i64) -> BackupFileMeta {
        BackupFileMeta {
            image_path: PathBuf::from("/repo/ctx-1/disk-0/1.qcow2"),
            backup_type: backup_type.to_string(),
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn young_full_is_retention_locked() {
        let m = meta("full", 2);
        let expiry = retention_lock_expiry(&policy(), &m, Utc::now());
        assert!(expiry.is_some());
        assert!(expiry.unwrap() > Utc::now());
    }

    #[test]
    fn old_full_is_deletable() {
        let m = meta("full", 8);
        assert!(retention_lock_expiry(&policy(), &m, Utc::now()).is_none());
    }

    #[test]
    fn unlock_happens_exactly_at_the_boundary() {
        let m = meta("full", 0);
        let at_boundary = m.created_at + Duration::days(7);
        assert!(retention_lock_expiry(&policy(), &m, at_boundary).is_none());
        let just_before = at_boundary - Duration::seconds(1);
        assert!(retention_lock_expiry(&policy(), &m, just_before).is_some());
    }

    #[test]
    fn incrementals_ignore_policy_unless_opted_in() {
        let m = meta("incremental", 0);
        assert!(retention_lock_expiry(&policy(), &m, Utc::now()).is_none());

        let mut opted = policy();
        opted.apply_to_incrementals = true;
        assert!(retention_lock_expiry(&opted, &m, Utc::now()).is_some());
    }

    #[test]
    fn policy_application_by_type() {
        let p = policy();
        assert!(policy_applies(&p, "full"));
        assert!(!policy_applies(&p, "incremental"));
        assert!(!policy_applies(&p, "weird"));
    }
}
