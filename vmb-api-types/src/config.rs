use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_POOL_CAPACITY, SECTOR_SIZE};

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}
fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}
fn default_worker_threads() -> usize {
    4
}
fn default_max_retries() -> usize {
    3
}
fn default_retry_delay_ms() -> u64 {
    100
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Tuning of the block pipeline.
pub struct BackupConfig {
    /// Unit of fingerprinting, deduplication and upload.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Number of staging buffers, which bounds the uploads in flight.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Retries per block after the first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Declare the upload pipeline stalled if no upload finishes in time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_timeout_ms: Option<u64>,
    #[serde(default)]
    pub compress: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            pool_capacity: default_pool_capacity(),
            worker_threads: default_worker_threads(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            watchdog_timeout_ms: None,
            compress: false,
        }
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0 || self.block_size % SECTOR_SIZE != 0 {
            bail!(
                "block size {} is not a multiple of the sector size ({})",
                self.block_size,
                SECTOR_SIZE
            );
        }
        if self.pool_capacity == 0 {
            bail!("pool capacity must not be zero");
        }
        if self.worker_threads == 0 {
            bail!("worker thread count must not be zero");
        }
        if self.watchdog_timeout_ms == Some(0) {
            bail!("watchdog timeout must not be zero");
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn watchdog_timeout(&self) -> Option<Duration> {
        self.watchdog_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
/// Object store backend selection.
pub enum StoreConfig {
    /// Directory tree on a local or mounted file system.
    Local { path: PathBuf },
    /// Process local store, mainly for testing.
    Memory,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Parameters to connect to a raw disk image.
pub struct DiskParams {
    pub path: PathBuf,
    /// JSON file listing the regions changed since an earlier snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_regions: Option<PathBuf>,
    /// Reference of the disk state the image represents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
    /// Open for writing (restore target).
    #[serde(default)]
    pub writable: bool,
    /// Create the image with this size if it does not exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Everything needed to run a job against one volume.
pub struct JobConfig {
    pub client_id: String,
    pub volume_id: String,
    pub store: StoreConfig,
    /// Name of the encryption key. Unencrypted if missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ref: Option<String>,
    /// Key file providing the material for `key-ref`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
    /// Source disk for backups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskParams>,
    #[serde(default)]
    pub backup: BackupConfig,
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.client_id.is_empty() {
            bail!("missing client id");
        }
        if self.volume_id.is_empty() {
            bail!("missing volume id");
        }
        if self.keyfile.is_some() && self.key_ref.is_none() {
            bail!("keyfile given without key-ref");
        }
        self.backup.validate()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_job_config_defaults() -> Result<(), Error> {
        let config: JobConfig = serde_json::from_str(
            r#"{
                "client-id": "c1",
                "volume-id": "vol1",
                "store": { "type": "local", "path": "/srv/backup" },
                "disk": { "path": "/var/lib/images/vm-100.raw", "snapshot-ref": "snap-1" },
                "backup": { "block-size": 65536, "watchdog-timeout-ms": 30000 }
            }"#,
        )?;

        assert_eq!(config.backup.block_size, 65536);
        assert_eq!(config.backup.pool_capacity, DEFAULT_POOL_CAPACITY);
        assert_eq!(config.backup.watchdog_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(
            config.store,
            StoreConfig::Local {
                path: "/srv/backup".into()
            }
        );
        let disk = config.disk.as_ref().map(|disk| disk.snapshot_ref.as_deref());
        assert_eq!(disk, Some(Some("snap-1")));
        config.validate()?;

        Ok(())
    }

    #[test]
    fn test_backup_config_validation() {
        let mut config = BackupConfig::default();
        assert!(config.validate().is_ok());

        config.block_size = 1000;
        assert!(config.validate().is_err());

        config.block_size = DEFAULT_BLOCK_SIZE;
        config.pool_capacity = 0;
        assert!(config.validate().is_err());
    }
}
