//! Key references and the encryption seam used by the orchestrators

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use vmb_tools::crypt_config::CryptConfig;

use crate::DataBlob;

/// Turns block plaintext into stored blobs and back.
///
/// `key_ref` names the key; the empty reference means "not encrypted".
pub trait CryptoProvider: Send + Sync {
    /// Encode `plaintext` into `output` (cleared first).
    fn encrypt_into(&self, key_ref: &str, plaintext: &[u8], output: &mut Vec<u8>)
        -> Result<(), Error>;

    /// Verify and decode a stored blob.
    fn decrypt(&self, key_ref: &str, ciphertext: Vec<u8>) -> Result<Vec<u8>, Error>;
}

/// Encryption key file
///
/// Stores the raw key as hex, together with the key fingerprint so that
/// a wrong key file is detected before anything is written.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct KeyFile {
    pub key: String,
    #[serde(default)]
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl KeyFile {
    /// Creates a new key using random data.
    pub fn generate() -> Result<([u8; 32], Self), Error> {
        let mut key = [0u8; 32];
        openssl::rand::rand_bytes(&mut key)?;
        let crypt_config = CryptConfig::new(key)?;

        Ok((
            key,
            Self {
                key: hex::encode(key),
                created: proxmox_time::epoch_i64(),
                fingerprint: Some(hex::encode(crypt_config.fingerprint())),
            },
        ))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("unable to read key file {:?}", path))?;
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse key file {:?} - {}", path, err))
    }

    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).with_context(|| format!("unable to write key file {:?}", path))
    }

    /// Create the cipher configuration, checking the stored fingerprint.
    pub fn crypt_config(&self) -> Result<CryptConfig, Error> {
        let config = CryptConfig::from_hex(&self.key)?;
        if let Some(expected) = &self.fingerprint {
            let fingerprint = hex::encode(config.fingerprint());
            if &fingerprint != expected {
                bail!("key fingerprint mismatch ({} != {})", fingerprint, expected);
            }
        }
        Ok(config)
    }
}

/// Named encryption keys
#[derive(Default)]
pub struct Keyring {
    keys: HashMap<String, Arc<CryptConfig>>,
    compress: bool,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compress data (zstd) before encrypting it.
    pub fn compress(mut self, value: bool) -> Self {
        self.compress = value;
        self
    }

    pub fn insert(&mut self, key_ref: &str, config: CryptConfig) -> Result<(), Error> {
        if key_ref.is_empty() {
            bail!("empty key reference is reserved for unencrypted data");
        }
        self.keys.insert(key_ref.to_string(), Arc::new(config));
        Ok(())
    }

    /// Load a key file and register it under `key_ref`.
    pub fn load_key_file<P: AsRef<Path>>(&mut self, key_ref: &str, path: P) -> Result<(), Error> {
        let key_file = KeyFile::load(path)?;
        let config = key_file.crypt_config()?;
        log::debug!(
            "loaded key '{}' (fingerprint {})",
            key_ref,
            hex::encode(&config.fingerprint()[..8])
        );
        self.insert(key_ref, config)
    }

    pub fn contains(&self, key_ref: &str) -> bool {
        key_ref.is_empty() || self.keys.contains_key(key_ref)
    }

    /// Look up a key. `None` for the empty reference.
    pub fn lookup(&self, key_ref: &str) -> Result<Option<&CryptConfig>, Error> {
        if key_ref.is_empty() {
            return Ok(None);
        }
        match self.keys.get(key_ref) {
            Some(config) => Ok(Some(config.as_ref())),
            None => bail!("unknown encryption key '{}'", key_ref),
        }
    }
}

impl CryptoProvider for Keyring {
    fn encrypt_into(
        &self,
        key_ref: &str,
        plaintext: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<(), Error> {
        DataBlob::encode_into(plaintext, self.lookup(key_ref)?, self.compress, output)
    }

    fn decrypt(&self, key_ref: &str, ciphertext: Vec<u8>) -> Result<Vec<u8>, Error> {
        let blob = DataBlob::load_from_raw(ciphertext)?;
        if blob.is_encrypted() && key_ref.is_empty() {
            bail!("blob is encrypted, but no key given");
        }
        if !blob.is_encrypted() && !key_ref.is_empty() {
            bail!("expected blob encrypted with key '{}', found plain data", key_ref);
        }
        blob.decode(self.lookup(key_ref)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_keyring_roundtrip() -> Result<(), Error> {
        let mut keyring = Keyring::new().compress(true);
        keyring.insert("key1", CryptConfig::new([1u8; 32])?)?;
        assert!(keyring.insert("", CryptConfig::new([1u8; 32])?).is_err());

        let data = vec![5u8; 4096];
        let mut buffer = Vec::new();

        keyring.encrypt_into("key1", &data, &mut buffer)?;
        assert!(buffer.len() < data.len());
        assert_eq!(keyring.decrypt("key1", buffer.clone())?, data);
        assert!(keyring.decrypt("", buffer.clone()).is_err());

        keyring.encrypt_into("", &data, &mut buffer)?;
        assert_eq!(keyring.decrypt("", buffer.clone())?, data);
        assert!(keyring.decrypt("key1", buffer).is_err());

        assert!(keyring.encrypt_into("other", &data, &mut Vec::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_key_file() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("backup.key");

        let (key, key_file) = KeyFile::generate()?;
        key_file.store(&path)?;

        let mut keyring = Keyring::new();
        keyring.load_key_file("vm-key", &path)?;
        assert!(keyring.contains("vm-key"));
        let loaded = keyring.lookup("vm-key")?.map(|config| config.fingerprint());
        assert_eq!(loaded, Some(CryptConfig::new(key)?.fingerprint()));

        let mut broken = key_file;
        broken.fingerprint = Some("00".repeat(32));
        broken.store(&path)?;
        assert!(Keyring::new().load_key_file("vm-key", &path).is_err());

        Ok(())
    }
}
