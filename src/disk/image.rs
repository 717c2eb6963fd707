use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use vmb_api_types::{normalize_regions, DiskParams, Region};

use super::DiskAccess;

/// Changed block list exported by the hypervisor
///
/// ```json
/// { "since": "snap-7", "regions": [ { "offset": 0, "length": 65536 } ] }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedRegions {
    /// Snapshot reference the changes are relative to.
    pub since: String,
    pub regions: Vec<Region>,
}

impl ChangedRegions {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("unable to read changed regions {:?}", path))?;
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse changed regions {:?} - {}", path, err))
    }
}

/// Raw disk image file
///
/// The whole image counts as allocated. Changed regions come from an
/// external [ChangedRegions] file.
pub struct ImageFileDisk {
    name: String,
    file: File,
    size: u64,
    changed_regions: Option<PathBuf>,
    snapshot_ref: Option<String>,
}

impl ImageFileDisk {
    pub fn open(params: &DiskParams) -> Result<Self, Error> {
        let path = &params.path;

        let file = match params.create_size {
            Some(size) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)
                    .with_context(|| format!("unable to create image {:?}", path))?;
                if file.metadata()?.len() < size {
                    file.set_len(size)?;
                }
                file
            }
            None => OpenOptions::new()
                .read(true)
                .write(params.writable)
                .open(path)
                .with_context(|| format!("unable to open image {:?}", path))?,
        };

        let size = file.metadata()?.len();
        if size == 0 {
            bail!("image {:?} is empty", path);
        }

        Ok(Self {
            name: path.display().to_string(),
            file,
            size,
            changed_regions: params.changed_regions.clone(),
            snapshot_ref: params.snapshot_ref.clone(),
        })
    }
}

impl DiskAccess for ImageFileDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> u64 {
        self.size
    }

    fn query_allocated_regions(&self) -> Result<Vec<Region>, Error> {
        Ok(vec![Region::new(0, self.size)?])
    }

    fn query_changed_regions(&self, since_ref: &str) -> Result<Vec<Region>, Error> {
        let path = match &self.changed_regions {
            Some(path) => path,
            None => bail!("no changed regions available for image {}", self.name),
        };
        let changed = ChangedRegions::load(path)?;
        if changed.since != since_ref {
            bail!(
                "changed regions of {} are relative to '{}', not '{}'",
                self.name,
                changed.since,
                since_ref
            );
        }
        let regions = normalize_regions(changed.regions)?;
        if let Some(last) = regions.last() {
            if last.end() > self.size {
                bail!("changed region {} exceeds image size {}", last, self.size);
            }
        }
        Ok(regions)
    }

    fn begin_snapshot(&self) -> Result<Option<String>, Error> {
        Ok(self.snapshot_ref.clone())
    }

    fn read(&self, region: &Region) -> Result<Vec<u8>, Error> {
        if region.end() > self.size {
            bail!("region {} exceeds image size {}", region, self.size);
        }
        let mut data = vec![0u8; region.length as usize];
        self.file.read_exact_at(&mut data, region.offset)?;
        Ok(data)
    }

    fn write(&self, region: &Region, data: &[u8]) -> Result<(), Error> {
        if data.len() as u64 != region.length {
            bail!("write of {} bytes to region {}", data.len(), region);
        }
        if region.end() > self.size {
            bail!("region {} exceeds image size {}", region, self.size);
        }
        self.file.write_all_at(data, region.offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_image_file_disk() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("disk.raw");
        let changes = dir.path().join("changes.json");

        let params = DiskParams {
            path: image.clone(),
            changed_regions: Some(changes.clone()),
            snapshot_ref: Some("snap-2".to_string()),
            writable: true,
            create_size: Some(16384),
        };
        let disk = ImageFileDisk::open(&params)?;
        assert_eq!(disk.capacity(), 16384);
        assert_eq!(disk.begin_snapshot()?, Some("snap-2".to_string()));
        assert_eq!(disk.query_allocated_regions()?, vec![Region::new(0, 16384)?]);

        disk.write(&Region::new(4096, 4)?, b"data")?;
        assert_eq!(disk.read(&Region::new(4094, 8)?)?, b"\0\0data\0\0");
        assert!(disk.read(&Region::new(16000, 1000)?).is_err());

        assert!(disk.query_changed_regions("snap-1").is_err());
        let list = ChangedRegions {
            since: "snap-1".to_string(),
            regions: vec![Region::new(8192, 10)?, Region::new(0, 4096)?],
        };
        std::fs::write(&changes, serde_json::to_vec(&list)?)?;
        assert_eq!(
            disk.query_changed_regions("snap-1")?,
            vec![Region::new(0, 4096)?, Region::new(8192, 10)?]
        );
        assert!(disk.query_changed_regions("snap-0").is_err());

        let readonly = ImageFileDisk::open(&DiskParams {
            path: image,
            ..Default::default()
        })?;
        assert!(readonly.write(&Region::new(0, 1)?, b"x").is_err());
        Ok(())
    }
}
