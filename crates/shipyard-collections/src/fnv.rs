//! 32-bit FNV-1a hashing.
//!
//! Used wherever a key must land on the same shard or partition across
//! processes and restarts.

const OFFSET_BASIS: u32 = 2_166_136_261;
const PRIME: u32 = 16_777_619;

/// Hash `key` with 32-bit FNV-1a.
pub fn fnv1a_32(key: &str) -> u32 {
    key.as_bytes().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
    })
}
