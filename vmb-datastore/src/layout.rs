//! Bucket and key names

use anyhow::{bail, Error};

use vmb_api_types::BlockIndex;

pub const BLOCKDATA_DIR: &str = "blockdata";
pub const BACKUP_RECORD_NAME: &str = "index.json.blob";
pub const VOLUME_RECORD_NAME: &str = "volume.json.blob";

/// Ids end up in object keys, so only allow a safe character set.
pub fn check_id(kind: &str, id: &str) -> Result<(), Error> {
    if id.is_empty() || id.len() > 128 {
        bail!("invalid {} '{}' - bad length", kind, id);
    }
    if id.starts_with('.') {
        bail!("invalid {} '{}' - must not start with a dot", kind, id);
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        bail!("invalid {} '{}' - unexpected character {:?}", kind, id, c);
    }
    Ok(())
}

/// Generate a new id from a timestamp and some random bits.
pub fn generate_id(prefix: &str, epoch: i64) -> Result<String, Error> {
    let time: String = proxmox_time::epoch_to_rfc3339_utc(epoch)?
        .chars()
        .filter(|c| *c != '-' && *c != ':')
        .collect();
    let mut rand = [0u8; 4];
    openssl::rand::rand_bytes(&mut rand)?;
    Ok(format!("{}-{}-{}", prefix, time, hex::encode(rand)))
}

/// Object names for one protected volume
///
/// ```text
/// {bucket}/volume.json.blob
/// {bucket}/backups/{backup_id}/index.json.blob
/// {bucket}/backups/{backup_id}/blockdata/{index}
/// {bucket}/restores/{restore_id}.json.blob
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeLayout {
    client_id: String,
    volume_id: String,
    bucket: String,
}

impl VolumeLayout {
    pub fn new(client_id: &str, volume_id: &str) -> Result<Self, Error> {
        check_id("client id", client_id)?;
        check_id("volume id", volume_id)?;
        Ok(Self {
            client_id: client_id.to_string(),
            volume_id: volume_id.to_string(),
            bucket: format!("{}_{}", client_id, volume_id),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn backup_prefix(backup_id: &str) -> String {
        format!("backups/{}/", backup_id)
    }

    pub fn blockdata_prefix(backup_id: &str) -> String {
        format!("backups/{}/{}/", backup_id, BLOCKDATA_DIR)
    }

    /// Positional block key, relative to the bucket.
    pub fn block_key(backup_id: &str, index: BlockIndex) -> String {
        format!("{}{}", Self::blockdata_prefix(backup_id), index)
    }

    pub fn backup_record_key(backup_id: &str) -> String {
        format!("{}{}", Self::backup_prefix(backup_id), BACKUP_RECORD_NAME)
    }

    pub fn volume_record_key() -> &'static str {
        VOLUME_RECORD_NAME
    }

    pub fn restore_task_key(restore_id: &str) -> String {
        format!("restores/{}.json.blob", restore_id)
    }

    /// Parse the block index from a key below [blockdata_prefix](Self::blockdata_prefix).
    pub fn parse_block_key(backup_id: &str, key: &str) -> Option<BlockIndex> {
        key.strip_prefix(&Self::blockdata_prefix(backup_id))?
            .parse()
            .ok()
    }
}
