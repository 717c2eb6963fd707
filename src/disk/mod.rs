//! Disk layer capability
//!
//! The orchestrators access disks only through [DiskAccess]. Reads and
//! writes are blocking; they are issued from worker threads. Failed reads
//! and writes are reported per block as [BackupError::Io] by the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Error;

use vmb_api_types::{BackupError, DiskParams, Region};

mod image;
pub use image::{ChangedRegions, ImageFileDisk};

mod memory;
pub use memory::MemoryDisk;

pub trait DiskAccess: Send + Sync {
    /// Name used in log and error messages.
    fn name(&self) -> &str;

    /// Disk size in bytes.
    fn capacity(&self) -> u64;

    /// Regions holding data. Everything else reads as zeros.
    fn query_allocated_regions(&self) -> Result<Vec<Region>, Error>;

    /// Regions written since the disk state named by `since_ref`.
    fn query_changed_regions(&self, since_ref: &str) -> Result<Vec<Region>, Error>;

    /// Pin the disk state a backup reads and return its reference.
    ///
    /// `None` means the disk cannot name its state, so later runs cannot
    /// ask for changes relative to it.
    fn begin_snapshot(&self) -> Result<Option<String>, Error>;

    /// Read a region.
    fn read(&self, region: &Region) -> Result<Vec<u8>, Error>;

    fn write(&self, region: &Region, data: &[u8]) -> Result<(), Error>;
}

/// Opens disk handles.
pub trait DiskConnector: Send + Sync {
    /// Fails with [BackupError::Connect] before any I/O happened.
    fn connect(&self, params: &DiskParams) -> Result<Arc<dyn DiskAccess>, Error>;
}

/// Connects to raw image files.
#[derive(Default)]
pub struct ImageFileConnector;

impl DiskConnector for ImageFileConnector {
    fn connect(&self, params: &DiskParams) -> Result<Arc<dyn DiskAccess>, Error> {
        match ImageFileDisk::open(params) {
            Ok(disk) => Ok(Arc::new(disk)),
            Err(err) => Err(BackupError::Connect {
                disk: params.path.display().to_string(),
                msg: err.to_string(),
            }
            .into()),
        }
    }
}

/// Hands out registered in-memory disks by path.
#[derive(Default)]
pub struct MemoryDiskConnector {
    disks: Mutex<HashMap<String, Arc<MemoryDisk>>>,
}

impl MemoryDiskConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, disk: Arc<MemoryDisk>) {
        self.disks.lock().unwrap().insert(name.to_string(), disk);
    }
}

impl DiskConnector for MemoryDiskConnector {
    fn connect(&self, params: &DiskParams) -> Result<Arc<dyn DiskAccess>, Error> {
        let name = params.path.display().to_string();
        let disks = self.disks.lock().unwrap();
        match disks.get(&name) {
            Some(disk) => Ok(Arc::clone(disk) as Arc<dyn DiskAccess>),
            None => Err(BackupError::Connect {
                disk: name,
                msg: "no such disk".to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod test {
    use vmb_api_types::backup_error;

    use super::*;

    #[test]
    fn test_connect_errors() {
        let connector = MemoryDiskConnector::new();
        connector.register("vm-100-disk-0", Arc::new(MemoryDisk::new(4096)));

        let params = DiskParams {
            path: "vm-100-disk-0".into(),
            ..Default::default()
        };
        assert!(connector.connect(&params).is_ok());

        let params = DiskParams {
            path: "vm-101-disk-0".into(),
            ..Default::default()
        };
        let err = connector.connect(&params).err().unwrap();
        assert!(matches!(backup_error(&err), Some(BackupError::Connect { .. })));

        let params = DiskParams {
            path: "/nonexistent/vm-100-disk-0.raw".into(),
            ..Default::default()
        };
        let err = ImageFileConnector.connect(&params).err().unwrap();
        assert!(matches!(backup_error(&err), Some(BackupError::Connect { .. })));
    }
}
