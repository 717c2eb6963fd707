use std::ops::Range;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

/// Position of a block on the disk, counted in units of the block size.
pub type BlockIndex = u32;

/// A byte range on the disk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Region {
    pub offset: u64,
    pub length: u64,
}

impl Region {
    pub fn new(offset: u64, length: u64) -> Result<Self, Error> {
        if length == 0 {
            bail!("empty region at offset {}", offset);
        }
        if offset.checked_add(length).is_none() {
            bail!("region {}+{} overflows", offset, length);
        }
        Ok(Self { offset, length })
    }

    /// First byte behind the region.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Indices of all blocks touched by this region.
    pub fn block_range(&self, block_size: u64) -> Range<u64> {
        let first = self.offset / block_size;
        let last = (self.end() - 1) / block_size;
        first..(last + 1)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.offset, self.length)
    }
}

/// Sort regions by offset and merge overlapping or adjacent entries.
///
/// The disk layer gives no ordering guarantee, but a backup pass needs a
/// deterministic, non-overlapping sequence.
pub fn normalize_regions(mut regions: Vec<Region>) -> Result<Vec<Region>, Error> {
    for region in regions.iter() {
        Region::new(region.offset, region.length)?;
    }
    regions.sort();

    let mut result: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        match result.last_mut() {
            Some(last) if region.offset <= last.end() => {
                let end = last.end().max(region.end());
                last.length = end - last.offset;
            }
            _ => result.push(region),
        }
    }
    Ok(result)
}

/// Number of blocks needed to cover `disk_size` bytes.
pub fn block_count(disk_size: u64, block_size: u64) -> Result<BlockIndex, Error> {
    if block_size == 0 {
        bail!("invalid block size 0");
    }
    let count = (disk_size + block_size - 1) / block_size;
    BlockIndex::try_from(count)
        .map_err(|_| format_err!("disk size {} needs too many blocks ({})", disk_size, count))
}

/// The byte range covered by block `index`. The last block of a disk may be
/// shorter than `block_size`.
pub fn block_region(index: BlockIndex, block_size: u64, disk_size: u64) -> Result<Region, Error> {
    let offset = index as u64 * block_size;
    if offset >= disk_size {
        bail!("block {} is outside of the disk ({} bytes)", index, disk_size);
    }
    let length = block_size.min(disk_size - offset);
    Region::new(offset, length)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_regions() -> Result<(), Error> {
        let regions = vec![
            Region::new(4096, 512)?,
            Region::new(0, 1024)?,
            Region::new(512, 1024)?,
            Region::new(4608, 100)?,
        ];

        let normalized = normalize_regions(regions)?;
        assert_eq!(
            normalized,
            vec![Region::new(0, 1536)?, Region::new(4096, 612)?]
        );

        assert!(normalize_regions(vec![Region { offset: 5, length: 0 }]).is_err());

        Ok(())
    }

    #[test]
    fn test_block_geometry() -> Result<(), Error> {
        assert_eq!(block_count(0, 4096)?, 0);
        assert_eq!(block_count(4096, 4096)?, 1);
        assert_eq!(block_count(4097, 4096)?, 2);

        let last = block_region(1, 4096, 4097)?;
        assert_eq!(last, Region::new(4096, 1)?);
        assert!(block_region(2, 4096, 4097).is_err());

        let region = Region::new(4000, 200)?;
        assert_eq!(region.block_range(4096), 0..2);
        let region = Region::new(4096, 4096)?;
        assert_eq!(region.block_range(4096), 1..2);

        Ok(())
    }
}
