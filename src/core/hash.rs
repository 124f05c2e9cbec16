// Name hashing for the asset cache

/// 32-bit FNV-1a offset basis
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// 32-bit FNV-1a prime
const FNV_PRIME: u32 = 16_777_619;

/// Hash a name with 32-bit FNV-1a
///
/// Deterministic across runs and platforms, unlike `DefaultHasher`, so a name
/// always starts probing at the same cache slot.
pub fn fnv1a_32(name: &str) -> u32 {
    name.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Initial bucket for a name in a table of `len` slots
pub fn bucket(name: &str, len: usize) -> usize {
    debug_assert!(len > 0);
    fnv1a_32(name) as usize % len
}
