//! Object store capability
//!
//! The orchestrators only depend on [ObjectStore]. Backends are selected
//! with [open_store].

use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;

use vmb_api_types::StoreConfig;

mod local;
pub use local::LocalStore;

mod memory;
pub use memory::MemoryStore;

/// Bucket/key addressed blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend name, for log messages
    fn name(&self) -> &str;

    /// Store an object, replacing any existing object with the same key.
    ///
    /// The data is not referenced after the returned future completed.
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), Error>;

    /// Read an object. Returns `None` if it does not exist.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// List all keys starting with `prefix`, sorted.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error>;
}

/// Create the store described by `config`.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>, Error> {
    match config {
        StoreConfig::Local { path } => Ok(Arc::new(LocalStore::open(path)?)),
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
