//! This crate implements the storage side of VM block backups.
//!
//! # Data formats
//!
//! Block data and metadata records are stored as [DataBlob]s in an
//! [ObjectStore](object_store::ObjectStore). A blob starts with a magic
//! number and a CRC32 of the payload, encrypted blobs additionally carry
//! the AES-GCM IV and tag. See [file_formats] for details.
//!
//! # Layout
//!
//! Each protected volume owns one bucket, see [layout::VolumeLayout]. A
//! backup stores the blocks it uploaded under positional keys
//! (`backups/{backup_id}/blockdata/{index}`) and its
//! [BackupRecord](vmb_api_types::BackupRecord) next to them. Blocks that did
//! not change since the previous backup are not uploaded again; the record
//! names the earlier backup holding them instead.
//!
//! The volume record lists the completed backups in creation order. Its last
//! entry is the baseline for the next incremental backup.

pub mod crypto;
pub mod data_blob;
pub mod file_formats;
pub mod layout;
pub mod metadata;
pub mod object_store;

pub use crypto::{CryptoProvider, KeyFile, Keyring};
pub use data_blob::DataBlob;
pub use layout::VolumeLayout;
pub use metadata::MetadataStore;
pub use object_store::{open_store, LocalStore, MemoryStore, ObjectStore};
