use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};

use vmb_api_types::{normalize_regions, Region};

use super::DiskAccess;

struct DiskState {
    data: Vec<u8>,
    allocated: Vec<Region>,
    // every write in order, for change tracking
    write_log: Vec<Region>,
    // snapshot reference -> write log position at creation
    snapshots: HashMap<String, usize>,
    next_snapshot: u64,
    // reads touching `offset` fail while the counter is positive
    read_faults: Vec<(u64, usize)>,
}

/// Disk image kept in memory
///
/// Emulates changed block tracking: [begin_snapshot](DiskAccess::begin_snapshot)
/// returns a reference and every region written afterwards is reported as
/// changed relative to it.
pub struct MemoryDisk {
    name: String,
    state: Mutex<DiskState>,
}

impl MemoryDisk {
    /// A zero filled, unallocated disk.
    pub fn new(size: u64) -> Self {
        Self::with_name("memory", size)
    }

    pub fn with_name(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(DiskState {
                data: vec![0u8; size as usize],
                allocated: Vec::new(),
                write_log: Vec::new(),
                snapshots: HashMap::new(),
                next_snapshot: 1,
                read_faults: Vec::new(),
            }),
        }
    }

    /// Convenience wrapper around [DiskAccess::write].
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.write(&Region::new(offset, data.len() as u64)?, data)
    }

    /// Copy of the current disk contents.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.clone()
    }

    /// Grow or shrink the image. New space reads as zeros.
    pub fn resize(&self, size: u64) {
        let mut state = self.state.lock().unwrap();
        state.data.resize(size as usize, 0);
        let allocated = std::mem::take(&mut state.allocated);
        state.allocated = clip_regions(allocated, size);
    }

    /// Let the next `count` reads touching `offset` fail.
    pub fn inject_read_errors(&self, offset: u64, count: usize) {
        self.state.lock().unwrap().read_faults.push((offset, count));
    }
}

// Cut regions at the disk end, dropping those fully behind it.
fn clip_regions(regions: Vec<Region>, size: u64) -> Vec<Region> {
    regions
        .into_iter()
        .filter(|region| region.offset < size)
        .map(|region| Region {
            offset: region.offset,
            length: region.length.min(size - region.offset),
        })
        .collect()
}

fn check_bounds(region: &Region, size: u64) -> Result<(), Error> {
    if region.end() > size {
        bail!("region {} exceeds disk size {}", region, size);
    }
    Ok(())
}

impl DiskAccess for MemoryDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> u64 {
        self.state.lock().unwrap().data.len() as u64
    }

    fn query_allocated_regions(&self) -> Result<Vec<Region>, Error> {
        Ok(self.state.lock().unwrap().allocated.clone())
    }

    fn query_changed_regions(&self, since_ref: &str) -> Result<Vec<Region>, Error> {
        let state = self.state.lock().unwrap();
        let start = *state
            .snapshots
            .get(since_ref)
            .ok_or_else(|| format_err!("unknown snapshot reference '{}'", since_ref))?;
        let size = state.data.len() as u64;
        normalize_regions(clip_regions(state.write_log[start..].to_vec(), size))
    }

    fn begin_snapshot(&self) -> Result<Option<String>, Error> {
        let mut state = self.state.lock().unwrap();
        let snapshot_ref = format!("snap-{}", state.next_snapshot);
        state.next_snapshot += 1;
        let position = state.write_log.len();
        state.snapshots.insert(snapshot_ref.clone(), position);
        Ok(Some(snapshot_ref))
    }

    fn read(&self, region: &Region) -> Result<Vec<u8>, Error> {
        let mut state = self.state.lock().unwrap();
        check_bounds(region, state.data.len() as u64)?;

        for (offset, count) in state.read_faults.iter_mut() {
            if *count > 0 && *offset >= region.offset && *offset < region.end() {
                *count -= 1;
                bail!("injected read error at offset {}", offset);
            }
        }

        let start = region.offset as usize;
        Ok(state.data[start..start + region.length as usize].to_vec())
    }

    fn write(&self, region: &Region, data: &[u8]) -> Result<(), Error> {
        if data.len() as u64 != region.length {
            bail!("write of {} bytes to region {}", data.len(), region);
        }
        let mut state = self.state.lock().unwrap();
        check_bounds(region, state.data.len() as u64)?;

        let start = region.offset as usize;
        state.data[start..start + data.len()].copy_from_slice(data);

        let mut allocated = std::mem::take(&mut state.allocated);
        allocated.push(*region);
        state.allocated = normalize_regions(allocated)?;
        state.write_log.push(*region);
        Ok(())
    }
}
