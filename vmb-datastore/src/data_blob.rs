use anyhow::{bail, format_err, Error};

use vmb_tools::crypt_config::CryptConfig;

use super::file_formats::*;

const MAX_BLOB_SIZE: usize = 128 * 1024 * 1024;

/// Data blob binary storage format
///
/// Data blobs store arbitrary binary data (< 128MB), and can be
/// compressed and encrypted. Block data and metadata records are
/// stored this way.
pub struct DataBlob {
    raw_data: Vec<u8>, // tagged, compressed, encrypted data
}

impl DataBlob {
    /// accessor to raw_data field
    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    /// Returns raw_data size
    pub fn raw_size(&self) -> u64 {
        self.raw_data.len() as u64
    }

    /// Consume self and returns raw_data
    pub fn into_inner(self) -> Vec<u8> {
        self.raw_data
    }

    /// accessor to blob type (magic number)
    pub fn magic(&self) -> &[u8; 8] {
        magic_of(&self.raw_data)
    }

    /// accessor to crc32 checksum
    pub fn crc(&self) -> u32 {
        stored_crc(&self.raw_data)
    }

    /// compute the CRC32 checksum
    pub fn compute_crc(&self) -> u32 {
        compute_crc(&self.raw_data)
    }

    // verify the CRC32 checksum
    pub fn verify_crc(&self) -> Result<(), Error> {
        if self.compute_crc() != self.crc() {
            bail!("Data blob has wrong CRC checksum.");
        }
        Ok(())
    }

    /// Create a DataBlob, optionally compressed and/or encrypted
    pub fn encode(data: &[u8], config: Option<&CryptConfig>, compress: bool) -> Result<Self, Error> {
        let mut raw_data = Vec::new();
        Self::encode_into(data, config, compress, &mut raw_data)?;
        Ok(DataBlob { raw_data })
    }

    /// Encode ``data`` into ``output``, which is cleared first.
    ///
    /// This allows reusing staging buffers. Compression is only kept if the
    /// result is smaller than the input.
    pub fn encode_into(
        data: &[u8],
        config: Option<&CryptConfig>,
        compress: bool,
        output: &mut Vec<u8>,
    ) -> Result<(), Error> {
        if data.len() > MAX_BLOB_SIZE {
            bail!("data blob too large ({} bytes).", data.len());
        }

        output.clear();

        let compr_data;
        let (data, compressed) = if compress {
            compr_data = zstd::bulk::compress(data, 1)?;
            if compr_data.len() < data.len() {
                (&compr_data[..], true)
            } else {
                (data, false)
            }
        } else {
            (data, false)
        };

        if let Some(config) = config {
            let magic = if compressed {
                ENCR_COMPR_BLOB_MAGIC_1_0
            } else {
                ENCRYPTED_BLOB_MAGIC_1_0
            };
            output.reserve(ENCRYPTED_BLOB_HEADER_SIZE + data.len());
            output.extend_from_slice(&magic);
            output.resize(ENCRYPTED_BLOB_HEADER_SIZE, 0);

            let (iv, tag) = config.encrypt_to(data, &mut *output)?;

            output[IV_OFFSET..IV_OFFSET + 16].copy_from_slice(&iv);
            output[TAG_OFFSET..TAG_OFFSET + 16].copy_from_slice(&tag);
        } else {
            let magic = if compressed {
                COMPRESSED_BLOB_MAGIC_1_0
            } else {
                UNCOMPRESSED_BLOB_MAGIC_1_0
            };
            output.reserve(BLOB_HEADER_SIZE + data.len());
            output.extend_from_slice(&magic);
            output.resize(BLOB_HEADER_SIZE, 0);
            output.extend_from_slice(data);
        }

        let crc = compute_crc(output);
        output[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());

        Ok(())
    }

    /// Create Instance from raw data
    pub fn from_raw(data: Vec<u8>) -> Result<Self, Error> {
        check_raw(&data)?;
        Ok(DataBlob { raw_data: data })
    }

    /// Create Instance from raw data and verify the CRC
    pub fn load_from_raw(data: Vec<u8>) -> Result<Self, Error> {
        let blob = Self::from_raw(data)?;
        blob.verify_crc()?;
        Ok(blob)
    }

    /// Returns if blob is encrypted
    pub fn is_encrypted(&self) -> bool {
        let magic = self.magic();
        magic == &ENCR_COMPR_BLOB_MAGIC_1_0 || magic == &ENCRYPTED_BLOB_MAGIC_1_0
    }

    /// Returns if blob is compressed
    pub fn is_compressed(&self) -> bool {
        let magic = self.magic();
        magic == &ENCR_COMPR_BLOB_MAGIC_1_0 || magic == &COMPRESSED_BLOB_MAGIC_1_0
    }

    /// Decode blob data
    ///
    /// Encrypted blobs need the matching ``config``, decoding fails if the
    /// authentication tag does not match.
    pub fn decode(&self, config: Option<&CryptConfig>) -> Result<Vec<u8>, Error> {
        let magic = *self.magic();

        match magic {
            UNCOMPRESSED_BLOB_MAGIC_1_0 => Ok(self.raw_data[BLOB_HEADER_SIZE..].to_vec()),
            COMPRESSED_BLOB_MAGIC_1_0 => {
                let mut reader = &self.raw_data[BLOB_HEADER_SIZE..];
                Ok(zstd::stream::decode_all(&mut reader)?)
            }
            ENCRYPTED_BLOB_MAGIC_1_0 | ENCR_COMPR_BLOB_MAGIC_1_0 => {
                let config = match config {
                    Some(config) => config,
                    None => bail!("unable to decrypt blob - missing CryptConfig"),
                };
                let iv: [u8; 16] = self.raw_data[IV_OFFSET..IV_OFFSET + 16].try_into()?;
                let tag: [u8; 16] = self.raw_data[TAG_OFFSET..TAG_OFFSET + 16].try_into()?;

                let data =
                    config.decrypt(&self.raw_data[ENCRYPTED_BLOB_HEADER_SIZE..], &iv, &tag)?;

                if magic == ENCR_COMPR_BLOB_MAGIC_1_0 {
                    let mut reader = &data[..];
                    Ok(zstd::stream::decode_all(&mut reader)?)
                } else {
                    Ok(data)
                }
            }
            _ => bail!("Invalid blob magic number."),
        }
    }
}

fn magic_of(raw_data: &[u8]) -> &[u8; 8] {
    raw_data
        .get(0..8)
        .and_then(|magic| magic.try_into().ok())
        .unwrap_or(&[0u8; 8])
}

fn stored_crc(raw_data: &[u8]) -> u32 {
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&raw_data[CRC_OFFSET..CRC_OFFSET + 4]);
    u32::from_le_bytes(crc)
}

fn compute_crc(raw_data: &[u8]) -> u32 {
    let start = header_size(magic_of(raw_data)).unwrap_or(BLOB_HEADER_SIZE);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw_data[start..]);
    hasher.finalize()
}

fn check_raw(data: &[u8]) -> Result<(), Error> {
    if data.len() < BLOB_HEADER_SIZE {
        bail!("blob too small ({} bytes).", data.len());
    }
    let header_len = header_size(magic_of(data))
        .ok_or_else(|| format_err!("unable to parse raw blob - wrong magic"))?;
    if data.len() < header_len {
        bail!("encrypted blob too small ({} bytes).", data.len());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_data() -> Vec<u8> {
        let mut data = vec![0u8; 64 * 1024];
        for (i, b) in data.iter_mut().enumerate().step_by(7) {
            *b = (i % 13) as u8;
        }
        data
    }

    #[test]
    fn test_blob_variants() -> Result<(), Error> {
        let config = CryptConfig::new([3u8; 32])?;
        let data = test_data();

        for (crypt, compress, magic) in [
            (false, false, UNCOMPRESSED_BLOB_MAGIC_1_0),
            (false, true, COMPRESSED_BLOB_MAGIC_1_0),
            (true, false, ENCRYPTED_BLOB_MAGIC_1_0),
            (true, true, ENCR_COMPR_BLOB_MAGIC_1_0),
        ] {
            let config = if crypt { Some(&config) } else { None };
            let blob = DataBlob::encode(&data, config, compress)?;
            assert_eq!(blob.magic(), &magic);
            assert_eq!(blob.is_encrypted(), crypt);
            assert_eq!(blob.is_compressed(), compress);
            blob.verify_crc()?;

            let blob = DataBlob::load_from_raw(blob.into_inner())?;
            assert_eq!(blob.decode(config)?, data);
        }
        Ok(())
    }

    #[test]
    fn test_incompressible_data_stays_uncompressed() -> Result<(), Error> {
        let mut data = vec![0u8; 4096];
        openssl::rand::rand_bytes(&mut data)?;

        let blob = DataBlob::encode(&data, None, true)?;
        assert!(!blob.is_compressed());
        assert_eq!(blob.raw_size() as usize, BLOB_HEADER_SIZE + data.len());
        Ok(())
    }

    #[test]
    fn test_encode_into_reuses_buffer() -> Result<(), Error> {
        let mut buffer = Vec::with_capacity(8192);
        DataBlob::encode_into(&[1u8; 100], None, false, &mut buffer)?;
        DataBlob::encode_into(b"short", None, false, &mut buffer)?;
        assert_eq!(buffer.len(), BLOB_HEADER_SIZE + 5);

        let blob = DataBlob::load_from_raw(buffer)?;
        assert_eq!(blob.decode(None)?, b"short");
        Ok(())
    }

    #[test]
    fn test_corruption_detected() -> Result<(), Error> {
        let config = CryptConfig::new([3u8; 32])?;
        let data = test_data();

        let mut raw = DataBlob::encode(&data, Some(&config), false)?.into_inner();
        let last = raw.len() - 1;
        raw[last] ^= 0x40;
        assert!(DataBlob::load_from_raw(raw.clone()).is_err());

        // CRC ok but wrong key
        raw[last] ^= 0x40;
        let blob = DataBlob::load_from_raw(raw)?;
        assert!(blob.decode(None).is_err());
        assert!(blob.decode(Some(&CryptConfig::new([4u8; 32])?)).is_err());

        assert!(DataBlob::from_raw(vec![0u8; 4]).is_err());
        assert!(DataBlob::from_raw(vec![0u8; 64]).is_err());
        Ok(())
    }
}
