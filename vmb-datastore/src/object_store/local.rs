use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use async_trait::async_trait;

use super::ObjectStore;

/// Object store on a local (or mounted) file system
///
/// Buckets are directories below the base path, keys are relative paths
/// inside them. Objects are written to a temporary file first and renamed
/// into place, so readers never see partial objects.
pub struct LocalStore {
    base: PathBuf,
}

const TMP_MARKER: &str = ".tmp_";

fn check_component(kind: &str, name: &str) -> Result<(), Error> {
    if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
        bail!("invalid {} component '{}'", kind, name);
    }
    if name.contains(TMP_MARKER) {
        bail!("{} component '{}' uses reserved marker", kind, name);
    }
    Ok(())
}

impl LocalStore {
    /// Open (and create if needed) a store below `base`.
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self, Error> {
        let base = base.as_ref().to_path_buf();
        std::fs::create_dir_all(&base)
            .with_context(|| format!("unable to create store directory {:?}", base))?;
        Ok(Self { base })
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, Error> {
        if bucket.contains('/') {
            bail!("invalid bucket name '{}'", bucket);
        }
        check_component("bucket", bucket)?;
        Ok(self.base.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, Error> {
        let mut path = self.bucket_path(bucket)?;
        for component in key.split('/') {
            check_component("key", component)?;
            path.push(component);
        }
        Ok(path)
    }
}

fn collect_keys(dir: &Path, prefix: &str, keys: &mut Vec<String>) -> Result<(), Error> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => bail!("unable to list {:?} - {}", dir, err),
    };

    for entry in entries {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.contains(TMP_MARKER) {
            continue;
        }
        let key = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        if entry.file_type()?.is_dir() {
            collect_keys(&entry.path(), &key, keys)?;
        } else {
            keys.push(key);
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), Error> {
        let path = self.object_path(bucket, key)?;
        let parent = path
            .parent()
            .ok_or_else(|| format_err!("object path {:?} has no parent", path))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("unable to create directory {:?}", parent))?;

        let mut rand = [0u8; 8];
        openssl::rand::rand_bytes(&mut rand)?;
        let mut tmp_path = path.clone();
        tmp_path.set_file_name(format!(
            "{}{}{}",
            path.file_name().and_then(|name| name.to_str()).unwrap_or("object"),
            TMP_MARKER,
            hex::encode(rand)
        ));

        if let Err(err) = tokio::fs::write(&tmp_path, data).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            bail!("writing {:?} failed - {}", tmp_path, err);
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            bail!("atomic rename to {:?} failed - {}", path, err);
        }
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => bail!("unable to read {:?} - {}", path, err),
        }
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error> {
        let bucket_path = self.bucket_path(bucket)?;
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            collect_keys(&bucket_path, "", &mut keys)?;
            keys.retain(|key| key.starts_with(&prefix));
            keys.sort_unstable();
            Ok::<_, Error>(keys)
        })
        .await?
    }
}
