use std::sync::Arc;

use anyhow::{bail, Error};
use futures::stream::{self, StreamExt};

use vmb_api_types::{block_region, BackupStatus, BlockIndex, Fingerprint};
use vmb_datastore::{CryptoProvider, DataBlob, MetadataStore, VolumeLayout};
use vmb_tools::fingerprint;

/// Number of blobs fetched concurrently.
const VERIFY_CONCURRENCY: usize = 4;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub backup_id: String,
    pub verified: u64,
    pub missing: Vec<BlockIndex>,
    pub corrupt: Vec<BlockIndex>,
    pub empty: u64,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

enum BlockState {
    Ok,
    Missing,
    Corrupt,
}

/// Check every block blob referenced by a completed backup.
///
/// Blobs are looked up at the backup owning them, so reused blocks are
/// checked in the backup that uploaded them. Each blob has to pass the CRC
/// check, decode with the record's key and match the recorded length and
/// fingerprint.
pub async fn verify_backup(
    metadata: &MetadataStore,
    crypto: Arc<dyn CryptoProvider>,
    backup_id: &str,
) -> Result<VerifyReport, Error> {
    let record = metadata.get_backup_record(backup_id).await?;
    if record.status != BackupStatus::Complete {
        bail!("backup '{}' has status {}, nothing to verify", backup_id, record.status);
    }
    record.check_consistency()?;

    log::info!(
        "verify backup '{}' ({} blocks with data)",
        backup_id,
        record.block_table.len()
    );

    let store = metadata.store();
    let bucket = metadata.layout().bucket();
    let key_ref = record.encryption_key_ref.as_str();

    let results: Vec<(BlockIndex, BlockState)> = stream::iter(record.block_table.iter())
        .map(|(index, expected)| {
            let key = VolumeLayout::block_key(record.blob_owner(*index), *index);
            let region = block_region(*index, record.block_size, record.disk_size);
            let crypto = Arc::clone(&crypto);
            async move {
                let region = region?;
                let state = match store.get(bucket, &key).await? {
                    None => {
                        log::error!("block {} - blob '{}' is missing", index, key);
                        BlockState::Missing
                    }
                    Some(raw) => {
                        check_blob(&*crypto, key_ref, *index, raw, region.length, *expected)
                    }
                };
                Ok::<_, Error>((*index, state))
            }
        })
        .buffer_unordered(VERIFY_CONCURRENCY)
        .collect::<Vec<Result<_, Error>>>()
        .await
        .into_iter()
        .collect::<Result<_, Error>>()?;

    let mut report = VerifyReport {
        backup_id: backup_id.to_string(),
        empty: record.empty_blocks.len() as u64,
        ..Default::default()
    };
    for (index, state) in results {
        match state {
            BlockState::Ok => report.verified += 1,
            BlockState::Missing => report.missing.push(index),
            BlockState::Corrupt => report.corrupt.push(index),
        }
    }
    report.missing.sort_unstable();
    report.corrupt.sort_unstable();

    if report.is_ok() {
        log::info!("verify backup '{}' - ok ({} blocks)", backup_id, report.verified);
    } else {
        log::error!(
            "verify backup '{}' failed - {} missing, {} corrupt blocks",
            backup_id,
            report.missing.len(),
            report.corrupt.len()
        );
    }
    Ok(report)
}

fn check_blob(
    crypto: &dyn CryptoProvider,
    key_ref: &str,
    index: BlockIndex,
    raw: Vec<u8>,
    length: u64,
    expected: Fingerprint,
) -> BlockState {
    if let Err(err) = DataBlob::load_from_raw(raw.clone()) {
        log::error!("block {} - {}", index, err);
        return BlockState::Corrupt;
    }
    let data = match crypto.decrypt(key_ref, raw) {
        Ok(data) => data,
        Err(err) => {
            log::error!("block {} - unable to decode - {}", index, err);
            return BlockState::Corrupt;
        }
    };
    if data.len() as u64 != length {
        log::error!("block {} has {} bytes, expected {}", index, data.len(), length);
        return BlockState::Corrupt;
    }
    let digest = fingerprint(&data);
    if digest != expected {
        log::error!("block {} - fingerprint mismatch ({} != {})", index, digest, expected);
        return BlockState::Corrupt;
    }
    BlockState::Ok
}
