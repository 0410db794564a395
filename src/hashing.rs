//! Stable 64-bit hashing for user ids.
//!
//! `std`'s `DefaultHasher` makes no promise about its output across releases,
//! and both users of this module need values that never change: connection
//! shard routing and per-user clustering seeds.

const SEED_MIX: u64 = 0x9e37_79b1_85eb_ca87;

/// Mixes `data` into a 64-bit value starting from `seed`.
pub fn stable_hash(data: &[u8], seed: u64) -> u64 {
    let mut hash = seed ^ data.len() as u64;
    for &byte in data {
        hash ^= (byte as u64).wrapping_mul(0x1000_0000_01b3);
        hash = hash.rotate_left(13).wrapping_mul(0xff51_afd7_ed55_8ccd);
    }
    hash ^ (hash >> 33)
}

/// Per-user RNG seed derived from a run-wide base seed.
pub fn user_seed(base_seed: u64, user_id: &str) -> u64 {
    stable_hash(user_id.as_bytes(), base_seed ^ SEED_MIX)
}

/// Bucket in `0..buckets` owning `user_id`.
pub fn shard_for(user_id: &str, buckets: usize) -> usize {
    if buckets <= 1 {
        return 0;
    }
    (stable_hash(user_id.as_bytes(), 0) % buckets as u64) as usize
}
