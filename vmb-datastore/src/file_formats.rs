// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

// openssl::sha::sha256(b"VM block backup uncompressed blob v1.0")[0..8]
pub const UNCOMPRESSED_BLOB_MAGIC_1_0: [u8; 8] = [117, 159, 127, 141, 1, 85, 101, 60];

// openssl::sha::sha256(b"VM block backup zstd compressed blob v1.0")[0..8]
pub const COMPRESSED_BLOB_MAGIC_1_0: [u8; 8] = [145, 149, 128, 51, 161, 164, 193, 135];

// openssl::sha::sha256(b"VM block backup encrypted blob v1.0")[0..8]
pub const ENCRYPTED_BLOB_MAGIC_1_0: [u8; 8] = [254, 122, 217, 138, 146, 64, 70, 11];

// openssl::sha::sha256(b"VM block backup zstd compressed encrypted blob v1.0")[0..8]
pub const ENCR_COMPR_BLOB_MAGIC_1_0: [u8; 8] = [166, 36, 56, 35, 136, 115, 229, 115];

/// Data blob binary storage format
///
/// The format start with a 8 byte magic number to identify the type,
/// followed by a 4 byte CRC (little endian) over everything after the
/// header. The CRC detects storage corruption without the key.
///
/// Unencrypted blobs simply contain the CRC, followed by the
/// (compressed) data.
///
/// (MAGIC || CRC32 || Data)
pub const BLOB_HEADER_SIZE: usize = 8 + 4;

/// Encrypted data blob binary storage format
///
/// The header of encrypted blobs additionally contains a 16 byte IV,
/// followed by a 16 byte AES-GCM tag, followed by the encrypted data:
///
/// (MAGIC || CRC32 || IV || TAG || EncryptedData).
pub const ENCRYPTED_BLOB_HEADER_SIZE: usize = BLOB_HEADER_SIZE + 16 + 16;

pub const CRC_OFFSET: usize = 8;
pub const IV_OFFSET: usize = BLOB_HEADER_SIZE;
pub const TAG_OFFSET: usize = IV_OFFSET + 16;

/// Header size for different blob types
///
/// Returns `None` on unknown magic numbers.
pub fn header_size(magic: &[u8; 8]) -> Option<usize> {
    match *magic {
        UNCOMPRESSED_BLOB_MAGIC_1_0 | COMPRESSED_BLOB_MAGIC_1_0 => Some(BLOB_HEADER_SIZE),
        ENCRYPTED_BLOB_MAGIC_1_0 | ENCR_COMPR_BLOB_MAGIC_1_0 => Some(ENCRYPTED_BLOB_HEADER_SIZE),
        _ => None,
    }
}
