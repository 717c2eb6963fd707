use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Error;
use async_trait::async_trait;

use super::ObjectStore;

/// Process local object store.
#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects in `bucket`.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .lock()
            .unwrap()
            .get(bucket)
            .map(|objects| objects.len())
            .unwrap_or(0)
    }

    /// Replace an object without going through the async interface.
    pub fn insert_raw(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data);
    }

    pub fn remove(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.buckets
            .lock()
            .unwrap()
            .get_mut(bucket)
            .and_then(|objects| objects.remove(key))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), Error> {
        self.insert_raw(bucket, key, data.to_vec());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .buckets
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned()))
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error> {
        let buckets = self.buckets.lock().unwrap();
        let objects = match buckets.get(bucket) {
            Some(objects) => objects,
            None => return Ok(Vec::new()),
        };
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() -> Result<(), Error> {
        let store = MemoryStore::new();
        store.put("b1", "backups/x/blockdata/1", b"one").await?;
        store.put("b1", "backups/x/blockdata/0", b"zero").await?;
        store.put("b1", "backups/y/blockdata/0", b"other").await?;
        store.put("b2", "backups/x/blockdata/5", b"bucket").await?;

        assert_eq!(store.get("b1", "backups/x/blockdata/0").await?, Some(b"zero".to_vec()));
        assert_eq!(store.get("b1", "missing").await?, None);
        assert_eq!(store.get("b3", "missing").await?, None);

        assert_eq!(
            store.list_keys("b1", "backups/x/").await?,
            vec!["backups/x/blockdata/0", "backups/x/blockdata/1"]
        );
        assert_eq!(store.object_count("b1"), 3);
        assert!(store.remove("b1", "backups/y/blockdata/0").is_some());
        assert_eq!(store.object_count("b1"), 2);
        Ok(())
    }
}
