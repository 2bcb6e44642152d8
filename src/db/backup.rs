// Backup manager: full/incremental/differential dumps, optional gzip and
// AES-256-GCM encryption, SHA-256 checksums, on-disk history, cron-driven
// scheduling, retention, and restore.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cron::CronSchedule;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Incremental,
    Differential,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupType::Full => write!(f, "full"),
            BackupType::Incremental => write!(f, "incremental"),
            BackupType::Differential => write!(f, "differential"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupStatus::Completed => write!(f, "completed"),
            BackupStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub id: Uuid,
    pub backup_type: BackupType,
    pub status: BackupStatus,
    /// The prior completed backup an incremental/differential backup was
    /// taken against. `None` for full backups and for failed records that
    /// never resolved a base.
    pub base_backup_id: Option<Uuid>,
    pub path: std::path::PathBuf,
    pub size: u64,
    pub stored_size: u64,
    pub checksum: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// The external dump/restore tool. A real implementation shells out to
/// `pg_dump`/`pg_restore` or equivalent; tests supply a fake.
#[async_trait]
pub trait DumpTool: Send + Sync {
    async fn dump(&self, backup_type: BackupType, since: Option<DateTime<Utc>>) -> Result<Vec<u8>>;
    async fn restore(&self, target: &str, data: &[u8], recreate: bool) -> Result<()>;
}

const NONCE_LEN: usize = 12;

pub struct BackupManager {
    directory: std::path::PathBuf,
    compress: bool,
    encryption_key: Option<[u8; 32]>,
    dump_tool: Arc<dyn DumpTool>,
    history: RwLock<Vec<BackupRecord>>,
    last_full: RwLock<Option<DateTime<Utc>>>,
    last_completed: RwLock<Option<DateTime<Utc>>>,
    last_full_id: RwLock<Option<Uuid>>,
    last_completed_id: RwLock<Option<Uuid>>,
}

impl BackupManager {
    pub fn new(directory: impl Into<std::path::PathBuf>, compress: bool, encryption_key: Option<[u8; 32]>, dump_tool: Arc<dyn DumpTool>) -> Self {
        Self {
            directory: directory.into(),
            compress,
            encryption_key,
            dump_tool,
            history: RwLock::new(Vec::new()),
            last_full: RwLock::new(None),
            last_completed: RwLock::new(None),
            last_full_id: RwLock::new(None),
            last_completed_id: RwLock::new(None),
        }
    }

    pub fn history(&self) -> Vec<BackupRecord> {
        self.history.read().clone()
    }

    /// Run the dump/compress/encrypt/checksum/write pipeline and build a
    /// `Completed` record. Caller is responsible for recording a `Failed`
    /// record on error — nothing here touches `history` or the `last_*`
    /// trackers.
    async fn run_dump_pipeline(&self, backup_type: BackupType, since: Option<DateTime<Utc>>, started_at: DateTime<Utc>, id: Uuid, base_backup_id: Option<Uuid>) -> Result<BackupRecord> {
        let raw = self.dump_tool.dump(backup_type, since).await?;
        let size = raw.len() as u64;

        let compressed = if self.compress { gzip(&raw)? } else { raw };
        let (final_bytes, encrypted) = match &self.encryption_key {
            Some(key) => (encrypt(key, &compressed)?, true),
            None => (compressed, false),
        };
        let checksum = format!("{:x}", Sha256::digest(&final_bytes));

        std::fs::create_dir_all(&self.directory)?;
        let mut filename = format!("{backup_type}_backup_{}", started_at.format("%Y%m%dT%H%M%SZ"));
        if self.compress {
            filename.push_str(".gz");
        }
        if encrypted {
            filename.push_str(".enc");
        }
        let path = self.directory.join(&filename);
        std::fs::write(&path, &final_bytes)?;

        Ok(BackupRecord {
            id,
            backup_type,
            status: BackupStatus::Completed,
            base_backup_id,
            path,
            size,
            stored_size: final_bytes.len() as u64,
            checksum,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Incremental/differential backups require a prior completed base;
    /// failures are recorded (not dropped) so the history shows why a
    /// backup didn't produce a usable file.
    pub async fn create_backup(&self, backup_type: BackupType) -> Result<BackupRecord> {
        let started_at = Utc::now();
        let id = Uuid::new_v4();

        let base_backup_id = match backup_type {
            BackupType::Full => None,
            BackupType::Incremental => Some(*self.last_completed_id.read()),
            BackupType::Differential => Some(*self.last_full_id.read()),
        };
        let base_backup_id = match base_backup_id {
            None => None,
            Some(Some(id)) => Some(id),
            Some(None) => {
                return Err(Error::validation(format!("{backup_type} backup requires a prior completed backup")));
            }
        };
        let since = match backup_type {
            BackupType::Full => None,
            BackupType::Incremental => *self.last_completed.read(),
            BackupType::Differential => *self.last_full.read(),
        };

        match self.run_dump_pipeline(backup_type, since, started_at, id, base_backup_id).await {
            Ok(record) => {
                self.history.write().push(record.clone());
                *self.last_completed.write() = Some(record.completed_at);
                *self.last_completed_id.write() = Some(record.id);
                if backup_type == BackupType::Full {
                    *self.last_full.write() = Some(record.completed_at);
                    *self.last_full_id.write() = Some(record.id);
                }
                info!(id = %record.id, %backup_type, size = record.size, "backup completed");
                Ok(record)
            }
            Err(e) => {
                let failed = BackupRecord {
                    id,
                    backup_type,
                    status: BackupStatus::Failed,
                    base_backup_id,
                    path: std::path::PathBuf::new(),
                    size: 0,
                    stored_size: 0,
                    checksum: String::new(),
                    started_at,
                    completed_at: Utc::now(),
                };
                warn!(id = %failed.id, %backup_type, error = %e, "backup failed");
                self.history.write().push(failed);
                Err(e)
            }
        }
    }

    /// Recompute the checksum of the stored file and compare to the
    /// recorded one; the file must also still exist.
    pub fn validate(&self, record: &BackupRecord) -> Result<bool> {
        if !record.path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(&record.path)?;
        let checksum = format!("{:x}", Sha256::digest(&bytes));
        Ok(checksum == record.checksum)
    }

    /// Decrypt, decompress, and hand the dump bytes to the restore tool.
    pub async fn restore(&self, record: &BackupRecord, target: &str, recreate: bool) -> Result<()> {
        let mut bytes = std::fs::read(&record.path)?;
        if let Some(key) = &self.encryption_key {
            bytes = decrypt(key, &bytes)?;
        }
        if self.compress {
            bytes = gunzip(&bytes)?;
        }
        self.dump_tool.restore(target, &bytes, recreate).await
    }

    /// Delete every backup (file + history entry) whose `completed_at` is
    /// older than `retention_days`.
    pub fn apply_retention(&self, retention_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let mut history = self.history.write();
        let (expired, kept): (Vec<_>, Vec<_>) = history.drain(..).partition(|r| r.completed_at < cutoff);
        *history = kept;
        for record in &expired {
            if record.status != BackupStatus::Completed {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&record.path) {
                warn!(id = %record.id, error = %e, "failed to remove expired backup file");
            }
        }
        expired.len()
    }

    /// Run `create_backup(backup_type)` whenever `schedule` matches,
    /// checked once per minute.
    pub async fn run_scheduled(&self, schedule: CronSchedule, backup_type: BackupType) {
        let mut last_run: Option<DateTime<Utc>> = None;
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let now = Utc::now();
            if schedule.matches(now) && last_run != Some(now) {
                last_run = Some(now);
                if let Err(e) = self.create_backup(backup_type).await {
                    warn!(error = %e, "scheduled backup failed");
                }
            }
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// `nonce (12 bytes) || ciphertext+tag`.
fn encrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, data).map_err(|e| Error::fatal(format!("backup encryption failed: {e}")))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::validation("encrypted backup shorter than nonce header"));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| Error::fatal(format!("backup decryption failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDumpTool;
    #[async_trait]
    impl DumpTool for FakeDumpTool {
        async fn dump(&self, _backup_type: BackupType, _since: Option<DateTime<Utc>>) -> Result<Vec<u8>> {
            Ok(b"-- dump contents --".to_vec())
        }
        async fn restore(&self, _target: &str, _data: &[u8], _recreate: bool) -> Result<()> {
            Ok(())
        }
    }

    fn temp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("billing-core-backup-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn full_backup_round_trips_checksum() {
        let dir = temp_dir();
        let manager = BackupManager::new(dir.clone(), true, None, Arc::new(FakeDumpTool));
        let record = manager.create_backup(BackupType::Full).await.unwrap();
        assert!(manager.validate(&record).unwrap());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn encrypted_backup_decrypts_to_original_dump() {
        let dir = temp_dir();
        let key = [7u8; 32];
        let manager = BackupManager::new(dir.clone(), false, Some(key), Arc::new(FakeDumpTool));
        let record = manager.create_backup(BackupType::Full).await.unwrap();
        assert!(record.path.to_string_lossy().ends_with(".enc"));
        manager.restore(&record, "target_db", false).await.unwrap();
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn retention_deletes_old_backups() {
        let dir = temp_dir();
        let manager = BackupManager::new(dir.clone(), true, None, Arc::new(FakeDumpTool));
        let mut record = manager.create_backup(BackupType::Full).await.unwrap();
        record.completed_at = Utc::now() - chrono::Duration::days(40);
        manager.history.write()[0] = record;
        let removed = manager.apply_retention(30);
        assert_eq!(removed, 1);
        assert!(manager.history().is_empty());
        std::fs::remove_dir_all(dir).ok();
    }

    struct FailingDumpTool;
    #[async_trait]
    impl DumpTool for FailingDumpTool {
        async fn dump(&self, _backup_type: BackupType, _since: Option<DateTime<Utc>>) -> Result<Vec<u8>> {
            Err(Error::fatal("dump tool unavailable"))
        }
        async fn restore(&self, _target: &str, _data: &[u8], _recreate: bool) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_dump_preserves_failed_record_in_history() {
        let dir = temp_dir();
        let manager = BackupManager::new(dir.clone(), true, None, Arc::new(FailingDumpTool));
        let err = manager.create_backup(BackupType::Full).await;
        assert!(err.is_err());
        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, BackupStatus::Failed);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn incremental_backup_without_prior_base_is_rejected() {
        let dir = temp_dir();
        let manager = BackupManager::new(dir.clone(), true, None, Arc::new(FakeDumpTool));
        let result = manager.create_backup(BackupType::Incremental).await;
        assert!(result.is_err());
        assert!(manager.history().is_empty());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn incremental_backup_references_completed_base() {
        let dir = temp_dir();
        let manager = BackupManager::new(dir.clone(), true, None, Arc::new(FakeDumpTool));
        let full = manager.create_backup(BackupType::Full).await.unwrap();
        let incremental = manager.create_backup(BackupType::Incremental).await.unwrap();
        assert_eq!(incremental.base_backup_id, Some(full.id));
        std::fs::remove_dir_all(dir).ok();
    }
}
