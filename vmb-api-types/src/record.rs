use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

use anyhow::{bail, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{block_count, BlockIndex};

/// 64 bit content fingerprint of a block.
///
/// Only used for change detection and deduplication, never for
/// authentication. Serialized as 16 lowercase hex digits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.len() != 16 {
            bail!("invalid fingerprint '{}' - expected 16 hex digits", s);
        }
        Ok(Fingerprint(u64::from_str_radix(s, 16)?))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// State of a backup run.
pub enum BackupStatus {
    Running,
    Complete,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// State of a restore task.
pub enum RestoreStatus {
    Running,
    Complete,
    Error,
}

impl Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupStatus::Running => write!(f, "running"),
            BackupStatus::Complete => write!(f, "complete"),
            BackupStatus::Error => write!(f, "error"),
        }
    }
}

impl Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreStatus::Running => write!(f, "running"),
            RestoreStatus::Complete => write!(f, "complete"),
            RestoreStatus::Error => write!(f, "error"),
        }
    }
}

/// Result of one backup run.
///
/// `block_table` maps every non-empty block to its fingerprint and doubles as
/// the dedup index for the next incremental run. All-zero blocks are listed in
/// `empty_blocks` instead and have no stored blob. Blocks reused from an
/// earlier backup record the id of the backup holding their blob in
/// `block_origin`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupRecord {
    pub backup_id: String,
    pub volume_id: String,
    pub status: BackupStatus,
    #[serde(default)]
    pub encryption_key_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
    pub ctime: i64,
    pub disk_size: u64,
    pub block_size: u64,
    #[serde(default)]
    pub block_table: BTreeMap<BlockIndex, Fingerprint>,
    #[serde(default)]
    pub empty_blocks: BTreeSet<BlockIndex>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub block_origin: BTreeMap<BlockIndex, String>,
}

impl BackupRecord {
    pub fn new(
        backup_id: &str,
        volume_id: &str,
        encryption_key_ref: &str,
        disk_size: u64,
        block_size: u64,
    ) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            volume_id: volume_id.to_string(),
            status: BackupStatus::Running,
            encryption_key_ref: encryption_key_ref.to_string(),
            snapshot_ref: None,
            ctime: 0,
            disk_size,
            block_size,
            block_table: BTreeMap::new(),
            empty_blocks: BTreeSet::new(),
            block_origin: BTreeMap::new(),
        }
    }

    pub fn block_count(&self) -> Result<BlockIndex, Error> {
        block_count(self.disk_size, self.block_size)
    }

    /// Record a block with data. `origin` names the backup owning the blob if
    /// it was not uploaded by this run.
    pub fn set_block(&mut self, index: BlockIndex, fingerprint: Fingerprint, origin: Option<String>) {
        self.empty_blocks.remove(&index);
        self.block_table.insert(index, fingerprint);
        match origin {
            Some(origin) if origin != self.backup_id => {
                self.block_origin.insert(index, origin);
            }
            _ => {
                self.block_origin.remove(&index);
            }
        }
    }

    /// Record an all-zero block.
    pub fn set_empty(&mut self, index: BlockIndex) {
        self.block_table.remove(&index);
        self.block_origin.remove(&index);
        self.empty_blocks.insert(index);
    }

    /// Id of the backup whose blob holds block `index`.
    pub fn blob_owner(&self, index: BlockIndex) -> &str {
        self.block_origin
            .get(&index)
            .map(String::as_str)
            .unwrap_or(&self.backup_id)
    }

    /// Length of block `index`, `None` if it lies behind the disk end.
    pub fn block_length(&self, index: BlockIndex) -> Option<u64> {
        let offset = (index as u64).checked_mul(self.block_size)?;
        if offset >= self.disk_size {
            return None;
        }
        Some(self.block_size.min(self.disk_size - offset))
    }

    /// Copy the entry for `index` from a previous record.
    ///
    /// Returns false if `baseline` knows nothing about that block, or if the
    /// block covers a different byte range there (the disk was resized).
    pub fn inherit_block(&mut self, baseline: &BackupRecord, index: BlockIndex) -> bool {
        if baseline.block_size != self.block_size
            || baseline.block_length(index) != self.block_length(index)
        {
            return false;
        }
        if let Some(fingerprint) = baseline.block_table.get(&index) {
            let origin = baseline.blob_owner(index).to_string();
            self.set_block(index, *fingerprint, Some(origin));
            true
        } else if baseline.empty_blocks.contains(&index) {
            self.set_empty(index);
            true
        } else {
            false
        }
    }

    /// Check the structural invariants of the record.
    pub fn check_consistency(&self) -> Result<(), Error> {
        let count = self.block_count()?;

        for index in self.block_table.keys().chain(self.empty_blocks.iter()) {
            if *index >= count {
                bail!(
                    "backup '{}' references block {} beyond disk end ({} blocks)",
                    self.backup_id,
                    index,
                    count
                );
            }
        }
        if let Some(index) = self
            .empty_blocks
            .iter()
            .find(|index| self.block_table.contains_key(index))
        {
            bail!("backup '{}' lists block {} as empty and used", self.backup_id, index);
        }
        if let Some(index) = self
            .block_origin
            .keys()
            .find(|index| !self.block_table.contains_key(index))
        {
            bail!("backup '{}' has an origin for unknown block {}", self.backup_id, index);
        }
        Ok(())
    }
}

/// Append-only chain of backups taken from one volume.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VolumeRecord {
    #[serde(default)]
    pub backup_ids: Vec<String>,
}

impl VolumeRecord {
    pub fn latest(&self) -> Option<&str> {
        self.backup_ids.last().map(String::as_str)
    }

    pub fn append(&mut self, backup_id: &str) {
        self.backup_ids.push(backup_id.to_string());
    }
}

/// Progress and result of one restore.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RestoreTaskRecord {
    pub restore_id: String,
    pub backup_id: String,
    pub status: RestoreStatus,
    #[serde(default)]
    pub encryption_key_ref: String,
    pub ctime: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fingerprint_format() -> Result<(), Error> {
        let fingerprint = Fingerprint(0xe3069283caf52356);
        assert_eq!(fingerprint.to_string(), "e3069283caf52356");
        assert_eq!("e3069283caf52356".parse::<Fingerprint>()?, fingerprint);
        assert!("e30692".parse::<Fingerprint>().is_err());
        Ok(())
    }

    #[test]
    fn test_backup_record_serialization() -> Result<(), Error> {
        let mut record = BackupRecord::new("b2", "vol1", "key1", 8 * 4096, 4096);
        record.snapshot_ref = Some("snap-2".to_string());
        record.ctime = 1_700_000_000;
        record.set_block(0, Fingerprint(1), None);
        record.set_block(1, Fingerprint(u64::MAX), Some("b1".to_string()));
        record.set_block(3, Fingerprint(3), Some("b2".to_string()));
        record.set_empty(2);
        record.status = BackupStatus::Complete;

        let data = serde_json::to_vec(&record)?;
        let text = std::str::from_utf8(&data)?;
        assert!(text.contains("\"status\":\"complete\""));
        assert!(text.contains("\"ffffffffffffffff\""));

        let decoded: BackupRecord = serde_json::from_slice(&data)?;
        assert_eq!(decoded, record);
        assert_eq!(decoded.blob_owner(1), "b1");
        assert_eq!(decoded.blob_owner(3), "b2");
        decoded.check_consistency()?;

        Ok(())
    }

    #[test]
    fn test_inherit_block() {
        let mut baseline = BackupRecord::new("b1", "vol1", "", 4 * 4096, 4096);
        baseline.set_block(0, Fingerprint(10), None);
        baseline.set_block(1, Fingerprint(11), Some("b0".to_string()));
        baseline.set_empty(2);

        let mut record = BackupRecord::new("b2", "vol1", "", 4 * 4096, 4096);
        assert!(record.inherit_block(&baseline, 0));
        assert!(record.inherit_block(&baseline, 1));
        assert!(record.inherit_block(&baseline, 2));
        assert!(!record.inherit_block(&baseline, 3));

        assert_eq!(record.block_table.get(&0), Some(&Fingerprint(10)));
        assert_eq!(record.blob_owner(0), "b1");
        assert_eq!(record.blob_owner(1), "b0");
        assert!(record.empty_blocks.contains(&2));
    }

    #[test]
    fn test_inherit_block_after_resize() {
        // last block is 2048 bytes long
        let mut baseline = BackupRecord::new("b1", "vol1", "", 4 * 4096 + 2048, 4096);
        for index in 0..5 {
            baseline.set_block(index, Fingerprint(index as u64), None);
        }
        assert_eq!(baseline.block_length(4), Some(2048));
        assert_eq!(baseline.block_length(5), None);

        let mut grown = BackupRecord::new("b2", "vol1", "", 6 * 4096, 4096);
        assert!(grown.inherit_block(&baseline, 3));
        assert!(!grown.inherit_block(&baseline, 4));
        assert!(!grown.inherit_block(&baseline, 5));
        assert!(!grown.block_table.contains_key(&4));

        let mut shrunk = BackupRecord::new("b3", "vol1", "", 3 * 4096 + 100, 4096);
        assert!(shrunk.inherit_block(&baseline, 2));
        assert!(!shrunk.inherit_block(&baseline, 3));
    }

    #[test]
    fn test_consistency_check() {
        let mut record = BackupRecord::new("b1", "vol1", "", 2 * 4096, 4096);
        record.set_block(0, Fingerprint(1), None);
        record.set_empty(1);
        assert!(record.check_consistency().is_ok());

        record.block_table.insert(1, Fingerprint(2));
        assert!(record.check_consistency().is_err());

        record.block_table.remove(&1);
        record.block_table.insert(7, Fingerprint(2));
        assert!(record.check_consistency().is_err());
    }
}
