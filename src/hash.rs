//! Seeded MurmurHash64A over a single 64-bit word.
//!
//! Keys reaching the engine are already hashed, so cuckoo placement only
//! needs a cheap family of independent remixes: hash function `i` is
//! MurmurHash64A of the key seeded with `i`.

const M: u64 = 0xc6a4_a793_5bd1_e995;
const R: u32 = 47;

/// MurmurHash64A of the 8 little-endian bytes of `key`.
#[inline]
pub fn murmur_hash64(key: u64, seed: u64) -> u64 {
    let mut h = seed ^ 8u64.wrapping_mul(M);

    let mut k = key;
    k = k.wrapping_mul(M);
    k ^= k >> R;
    k = k.wrapping_mul(M);

    h ^= k;
    h = h.wrapping_mul(M);

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// The `hash_func_id`-th cuckoo hash of `key`.
#[inline]
pub fn cuckoo_hash(key: u64, hash_func_id: u8) -> u64 {
    murmur_hash64(key, hash_func_id as u64)
}
