//! Wrappers for OpenSSL crypto functions
//!
//! We use this to encrypt and decrypt block data. Cipher is
//! AES_256_GCM, which is fast and provides authenticated encryption.

use std::io::Write;

use anyhow::{format_err, Error};
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::symm::{decrypt_aead, Cipher, Crypter, Mode};

// openssl::sha::sha256(b"VM block backup key fingerprint")
/// This constant is used to compute fingerprints.
const FINGERPRINT_INPUT: [u8; 32] = [
    26, 97, 239, 142, 209, 64, 253, 254, 100, 27, 189, 216, 173, 7, 182, 143, 139, 52, 228, 162,
    20, 141, 14, 88, 99, 51, 41, 37, 26, 187, 72, 151,
];

const BUFFER_SIZE: usize = 32 * 1024;

/// Encryption Configuration with secret key
///
/// This structure stores the secret key and provides helpers for
/// authenticated encryption.
pub struct CryptConfig {
    cipher: Cipher,
    // derived key, only used to fingerprint the key
    id_key: [u8; 32],
    // The private key used by the cipher.
    enc_key: [u8; 32],
}

impl CryptConfig {
    /// Create a new instance.
    ///
    /// We compute a derived 32 byte key using pbkdf2_hmac, so that the key
    /// fingerprint does not reveal anything about the key itself.
    pub fn new(enc_key: [u8; 32]) -> Result<Self, Error> {
        let mut id_key = [0u8; 32];

        pbkdf2_hmac(&enc_key, b"_id_key", 10, MessageDigest::sha256(), &mut id_key)?;

        Ok(Self {
            id_key,
            enc_key,
            cipher: Cipher::aes_256_gcm(),
        })
    }

    /// Parse a key given as 64 hex digits.
    pub fn from_hex(text: &str) -> Result<Self, Error> {
        let bytes = hex::decode(text.trim())
            .map_err(|err| format_err!("unable to parse encryption key - {}", err))?;
        let enc_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format_err!("encryption key has wrong length (expected 32 bytes)"))?;
        Self::new(enc_key)
    }

    /// Expose Cipher (AES_256_GCM)
    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    /// Computes a fingerprint for the secret key.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = openssl::sha::Sha256::new();
        hasher.update(&FINGERPRINT_INPUT);
        hasher.update(&self.id_key);
        hasher.finish()
    }

    /// Returns an openssl Crypter using AES_256_GCM,
    pub fn data_crypter(&self, iv: &[u8; 16], mode: Mode) -> Result<Crypter, Error> {
        let mut crypter = Crypter::new(self.cipher, mode, &self.enc_key, Some(iv))?;
        crypter.aad_update(b"")?;
        Ok(crypter)
    }

    /// Encrypt data using a random 16 byte IV.
    ///
    /// Writes encrypted data to ``output``, returns the used IV and computed
    /// tag.
    pub fn encrypt_to<W: Write>(
        &self,
        data: &[u8],
        mut output: W,
    ) -> Result<([u8; 16], [u8; 16]), Error> {
        let mut iv = [0u8; 16];
        openssl::rand::rand_bytes(&mut iv)?;

        let mut tag = [0u8; 16];

        let mut c = self.data_crypter(&iv, Mode::Encrypt)?;

        let mut encr_buf = vec![0u8; BUFFER_SIZE];
        let max_encoder_input = BUFFER_SIZE - self.cipher.block_size();

        for chunk in data.chunks(max_encoder_input) {
            let count = c.update(chunk, &mut encr_buf)?;
            output.write_all(&encr_buf[..count])?;
        }

        let rest = c.finalize(&mut encr_buf)?;
        if rest > 0 {
            output.write_all(&encr_buf[..rest])?;
        }

        output.flush()?;

        c.get_tag(&mut tag)?;

        Ok((iv, tag))
    }

    /// Decrypt data, verify tag.
    pub fn decrypt(&self, data: &[u8], iv: &[u8; 16], tag: &[u8; 16]) -> Result<Vec<u8>, Error> {
        decrypt_aead(self.cipher, &self.enc_key, Some(iv), b"", data, tag)
            .map_err(|err| format_err!("unable to decrypt data - {}", err))
    }
}
