//! Block content fingerprints
//!
//! A fingerprint is the concatenation of two CRC32C (Castagnoli) streams
//! over the same block. The first stream uses the conventional seed, the
//! second one uses a different seed and is fed the bitwise complement of the
//! input, so the two halves are not linear transforms of each other. Both
//! final values are complemented, as usual for CRCs.
//!
//! On x86_64 CPUs with SSE 4.2 the hardware `crc32` instruction is used,
//! otherwise a table driven implementation with identical output.

use crc::{Crc, CRC_32_ISCSI};

use vmb_api_types::Fingerprint;

const SEED_A: u32 = 0xFFFF_FFFF;
const SEED_B: u32 = 0xDEAD_BEEF;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

// input is reflected, so the crc crate expects reflected initial values
fn seeded_digest(seed: u32) -> crc::Digest<'static, u32> {
    CASTAGNOLI.digest_with_initial(seed.reverse_bits())
}

fn combine(crc_a: u32, crc_b: u32) -> Fingerprint {
    Fingerprint(((crc_a as u64) << 32) | (crc_b as u64))
}

/// Compute the fingerprint of a block.
///
/// Pure and deterministic, safe to call from any number of threads.
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("sse4.2") {
            // SAFETY: the CPU supports the instructions used by `crc_pair`
            let (crc_a, crc_b) = unsafe { sse42::crc_pair(data, SEED_A, SEED_B) };
            return combine(!crc_a, !crc_b);
        }
    }
    fingerprint_portable(data)
}

/// Table driven fallback, produces the same values as the hardware path.
pub fn fingerprint_portable(data: &[u8]) -> Fingerprint {
    let mut digest_a = seeded_digest(SEED_A);
    let mut digest_b = seeded_digest(SEED_B);

    digest_a.update(data);

    let mut inverted = [0u8; 512];
    for chunk in data.chunks(inverted.len()) {
        for (dst, src) in inverted.iter_mut().zip(chunk) {
            *dst = !src;
        }
        digest_b.update(&inverted[..chunk.len()]);
    }

    combine(digest_a.finalize(), digest_b.finalize())
}

#[cfg(target_arch = "x86_64")]
mod sse42 {
    use std::arch::x86_64::{_mm_crc32_u64, _mm_crc32_u8};

    #[target_feature(enable = "sse4.2")]
    pub(super) unsafe fn crc_pair(data: &[u8], mut crc_a: u32, mut crc_b: u32) -> (u32, u32) {
        let mut chunks = data.chunks_exact(8);
        for chunk in &mut chunks {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            let value = u64::from_le_bytes(word);
            crc_a = _mm_crc32_u64(crc_a as u64, value) as u32;
            crc_b = _mm_crc32_u64(crc_b as u64, !value) as u32;
        }
        for &byte in chunks.remainder() {
            crc_a = _mm_crc32_u8(crc_a, byte);
            crc_b = _mm_crc32_u8(crc_b, !byte);
        }
        (crc_a, crc_b)
    }
}

/// Returns true if the block contains only zero bytes.
pub fn is_zero_block(data: &[u8]) -> bool {
    let mut chunks = data.chunks_exact(16);
    for chunk in &mut chunks {
        let mut word = [0u8; 16];
        word.copy_from_slice(chunk);
        if u128::from_ne_bytes(word) != 0 {
            return false;
        }
    }
    chunks.remainder().iter().all(|&b| b == 0)
}
