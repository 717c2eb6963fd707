//! Job configuration files
//!
//! A job file is JSON in the shape of [JobConfig]:
//!
//! ```json
//! {
//!     "client-id": "pve1",
//!     "volume-id": "vm-100-disk-0",
//!     "store": { "type": "local", "path": "/srv/vmbackup" },
//!     "key-ref": "pve1-main",
//!     "keyfile": "/etc/vmbackup/pve1-main.key",
//!     "disk": { "path": "/var/lib/images/vm-100-disk-0.raw" },
//!     "backup": { "block-size": 1048576, "pool-capacity": 10 }
//! }
//! ```

use std::path::Path;

use anyhow::{bail, format_err, Context, Error};

use vmb_api_types::JobConfig;
use vmb_datastore::{open_store, Keyring, MetadataStore, VolumeLayout};

use crate::disk::{DiskAccess, DiskConnector};

/// Read and validate a job file.
pub fn load_job_config<P: AsRef<Path>>(path: P) -> Result<JobConfig, Error> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("unable to read job file {:?}", path))?;
    let config: JobConfig = serde_json::from_slice(&data)
        .map_err(|err| format_err!("unable to parse job file {:?} - {}", path, err))?;
    config
        .validate()
        .map_err(|err| format_err!("invalid job file {:?} - {}", path, err))?;
    Ok(config)
}

/// The key reference blocks of this job are encrypted with, empty if none.
pub fn job_key_ref(config: &JobConfig) -> &str {
    config.key_ref.as_deref().unwrap_or("")
}

/// Keyring holding the key of the job.
pub fn keyring_for(config: &JobConfig) -> Result<Keyring, Error> {
    let mut keyring = Keyring::new().compress(config.backup.compress);
    match (&config.key_ref, &config.keyfile) {
        (Some(key_ref), Some(keyfile)) => keyring.load_key_file(key_ref, keyfile)?,
        (Some(key_ref), None) => bail!("no key file for encryption key '{}'", key_ref),
        (None, _) => (),
    }
    Ok(keyring)
}

/// Metadata access for the volume of the job.
pub fn metadata_for(config: &JobConfig) -> Result<MetadataStore, Error> {
    let store = open_store(&config.store)?;
    let layout = VolumeLayout::new(&config.client_id, &config.volume_id)?;
    log::debug!("using store '{}', bucket '{}'", store.name(), layout.bucket());
    Ok(MetadataStore::new(store, layout))
}

/// Connect to the source disk of the job.
pub fn connect_disk(
    config: &JobConfig,
    connector: &dyn DiskConnector,
) -> Result<std::sync::Arc<dyn DiskAccess>, Error> {
    match &config.disk {
        Some(params) => connector.connect(params),
        None => bail!("job for volume '{}' has no disk configured", config.volume_id),
    }
}
