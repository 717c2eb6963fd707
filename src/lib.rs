//! Block level backup of VM disks to object storage
//!
//! A backup reads the disk block by block, skips all-zero blocks and, for
//! incremental runs, blocks whose fingerprint did not change since the
//! previous backup. Remaining blocks are encoded into pool buffers and
//! uploaded asynchronously. The pool only returns to full capacity once the
//! last upload finished, which is what allows the backup record to be
//! published.
//!
//! Restore writes the blocks of a backup record back to a disk, fetching
//! reused blocks from the backup which uploaded them.

pub mod abort;
pub mod backup;
pub mod config;
pub mod disk;
pub mod restore;
pub mod uploader;
pub mod verify;
pub mod watchdog;

pub use abort::AbortHandle;
pub use backup::{BackupJob, BackupOutcome, BackupRequest, BackupState, BackupStats};
pub use restore::{RestoreJob, RestoreOutcome, RestoreRequest, RestoreState, RestoreStats};
pub use verify::{verify_backup, VerifyReport};
