//! Basic API types used by most of the VM block backup code.

/// Size of a disk sector, the smallest unit the disk layer reads or writes.
pub const SECTOR_SIZE: u64 = 512;

/// Default block size, 2048 sectors (1 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 2048 * SECTOR_SIZE;

/// Default number of pool buffers, which is also the upload concurrency.
pub const DEFAULT_POOL_CAPACITY: usize = 10;

mod config;
pub use config::*;

mod error;
pub use error::*;

mod record;
pub use record::*;

mod region;
pub use region::*;
