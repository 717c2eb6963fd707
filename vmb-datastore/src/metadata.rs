use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use serde::de::DeserializeOwned;
use serde::Serialize;

use vmb_api_types::{
    BackupError, BackupRecord, BackupStatus, BlockIndex, RestoreTaskRecord, VolumeRecord,
};

use crate::layout::{check_id, VolumeLayout};
use crate::object_store::ObjectStore;
use crate::DataBlob;

/// Records are stored as JSON inside a compressed, unencrypted data blob.
fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(record)?;
    Ok(DataBlob::encode(&json, None, true)?.into_inner())
}

fn decode_record<T: DeserializeOwned>(what: &str, raw: Vec<u8>) -> Result<T, Error> {
    let blob = DataBlob::load_from_raw(raw)
        .map_err(|err| format_err!("unable to load {} - {}", what, err))?;
    let json = blob.decode(None)?;
    serde_json::from_slice(&json).map_err(|err| format_err!("unable to parse {} - {}", what, err))
}

/// Reads and writes the records of one volume.
#[derive(Clone)]
pub struct MetadataStore {
    store: Arc<dyn ObjectStore>,
    layout: VolumeLayout,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn ObjectStore>, layout: VolumeLayout) -> Self {
        Self { store, layout }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    async fn put<T: Serialize + Sync>(&self, key: &str, record: &T) -> Result<(), Error> {
        let data = encode_record(record)?;
        self.store.put(self.layout.bucket(), key, &data).await
    }

    async fn get<T: DeserializeOwned>(&self, what: &str, key: &str) -> Result<Option<T>, Error> {
        match self.store.get(self.layout.bucket(), key).await? {
            Some(raw) => Ok(Some(decode_record(what, raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put_backup_record(&self, record: &BackupRecord) -> Result<(), Error> {
        check_id("backup id", &record.backup_id)?;
        if record.volume_id != self.layout.volume_id() {
            bail!(
                "backup '{}' belongs to volume '{}', not '{}'",
                record.backup_id,
                record.volume_id,
                self.layout.volume_id()
            );
        }
        self.put(&VolumeLayout::backup_record_key(&record.backup_id), record)
            .await
    }

    /// Fetch a backup record, failing with `NotFound` if it does not exist.
    pub async fn get_backup_record(&self, backup_id: &str) -> Result<BackupRecord, Error> {
        check_id("backup id", backup_id)?;
        let what = format!("backup record '{}'", backup_id);
        match self
            .get(&what, &VolumeLayout::backup_record_key(backup_id))
            .await?
        {
            Some(record) => Ok(record),
            None => Err(BackupError::not_found("backup", backup_id).into()),
        }
    }

    /// The backup chain of the volume. Empty if nothing was backed up yet.
    pub async fn get_volume_record(&self) -> Result<VolumeRecord, Error> {
        Ok(self
            .get("volume record", VolumeLayout::volume_record_key())
            .await?
            .unwrap_or_default())
    }

    /// Append a finished backup to the volume chain.
    ///
    /// Runs of the same volume are not concurrent, so read-modify-write is
    /// sufficient here.
    pub async fn append_backup(&self, backup_id: &str) -> Result<VolumeRecord, Error> {
        let mut volume = self.get_volume_record().await?;
        if volume.backup_ids.iter().any(|id| id == backup_id) {
            bail!("backup '{}' already listed for volume '{}'", backup_id, self.layout.volume_id());
        }
        volume.append(backup_id);
        self.put(VolumeLayout::volume_record_key(), &volume).await?;
        Ok(volume)
    }

    /// The most recent completed backup of `volume_id`, if any.
    pub async fn get_latest_backup_for(
        &self,
        volume_id: &str,
    ) -> Result<Option<BackupRecord>, Error> {
        if volume_id != self.layout.volume_id() {
            return Err(BackupError::not_found("volume", volume_id).into());
        }
        let volume = self.get_volume_record().await?;
        let backup_id = match volume.latest() {
            Some(backup_id) => backup_id,
            None => return Ok(None),
        };
        let record = self.get_backup_record(backup_id).await?;
        if record.status != BackupStatus::Complete {
            bail!("latest backup '{}' has status {}", backup_id, record.status);
        }
        Ok(Some(record))
    }

    pub async fn put_restore_task(&self, record: &RestoreTaskRecord) -> Result<(), Error> {
        check_id("restore id", &record.restore_id)?;
        self.put(&VolumeLayout::restore_task_key(&record.restore_id), record)
            .await
    }

    pub async fn get_restore_task(&self, restore_id: &str) -> Result<RestoreTaskRecord, Error> {
        check_id("restore id", restore_id)?;
        let what = format!("restore task '{}'", restore_id);
        match self
            .get(&what, &VolumeLayout::restore_task_key(restore_id))
            .await?
        {
            Some(record) => Ok(record),
            None => Err(BackupError::not_found("restore task", restore_id).into()),
        }
    }

    /// Indices of all block blobs uploaded by `backup_id`, sorted.
    ///
    /// Blocks reused from earlier backups are not included.
    pub async fn list_backup_blocks(&self, backup_id: &str) -> Result<Vec<BlockIndex>, Error> {
        check_id("backup id", backup_id)?;
        let keys = self
            .store
            .list_keys(self.layout.bucket(), &VolumeLayout::blockdata_prefix(backup_id))
            .await?;
        let mut list: Vec<BlockIndex> = keys
            .iter()
            .filter_map(|key| VolumeLayout::parse_block_key(backup_id, key))
            .collect();
        list.sort_unstable();
        Ok(list)
    }
}

#[cfg(test)]
mod test {
    use vmb_api_types::{backup_error, Fingerprint, RestoreStatus};

    use super::*;
    use crate::object_store::MemoryStore;

    fn metadata() -> Result<MetadataStore, Error> {
        Ok(MetadataStore::new(
            Arc::new(MemoryStore::new()),
            VolumeLayout::new("client1", "vol1")?,
        ))
    }

    #[tokio::test]
    async fn test_backup_records() -> Result<(), Error> {
        let metadata = metadata()?;

        assert!(metadata.get_latest_backup_for("vol1").await?.is_none());
        let err = metadata.get_backup_record("b1").await.unwrap_err();
        assert!(matches!(
            backup_error(&err),
            Some(BackupError::NotFound { kind: "backup", .. })
        ));

        let mut record = BackupRecord::new("b1", "vol1", "", 4 * 4096, 4096);
        record.set_block(0, Fingerprint(0x1234), None);
        record.set_empty(1);
        record.status = BackupStatus::Complete;
        metadata.put_backup_record(&record).await?;
        metadata.append_backup("b1").await?;
        assert!(metadata.append_backup("b1").await.is_err());

        assert_eq!(metadata.get_backup_record("b1").await?, record);
        assert_eq!(metadata.get_latest_backup_for("vol1").await?, Some(record));
        assert!(metadata.get_latest_backup_for("vol2").await.is_err());

        let mut other = BackupRecord::new("b2", "vol2", "", 4096, 4096);
        assert!(metadata.put_backup_record(&other).await.is_err());
        other.volume_id = "vol1".to_string();
        metadata.put_backup_record(&other).await?;
        metadata.append_backup("b2").await?;
        assert_eq!(metadata.get_volume_record().await?.backup_ids, vec!["b1", "b2"]);

        // a listed backup that is not complete is never used as baseline
        assert!(metadata.get_latest_backup_for("vol1").await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_restore_task_and_block_listing() -> Result<(), Error> {
        let metadata = metadata()?;
        let bucket = metadata.layout().bucket().to_string();

        let task = RestoreTaskRecord {
            restore_id: "r1".to_string(),
            backup_id: "b1".to_string(),
            status: RestoreStatus::Running,
            encryption_key_ref: String::new(),
            ctime: 10,
        };
        metadata.put_restore_task(&task).await?;
        assert_eq!(metadata.get_restore_task("r1").await?, task);
        assert!(metadata.get_restore_task("r2").await.is_err());

        for index in [7, 2, 11] {
            metadata
                .store()
                .put(&bucket, &VolumeLayout::block_key("b1", index), b"x")
                .await?;
        }
        metadata
            .store()
            .put(&bucket, &VolumeLayout::backup_record_key("b1"), b"x")
            .await?;
        assert_eq!(metadata.list_backup_blocks("b1").await?, vec![2, 7, 11]);
        assert!(metadata.list_backup_blocks("b2").await?.is_empty());

        Ok(())
    }
}
