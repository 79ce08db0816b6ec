use std::hash::Hasher;

use siphasher::sip::SipHasher13;

// Fixed keys: cache hashes must be stable across processes and runs.
const HASH_KEY_0: u64 = 0x6c67_6e5f_7368_6472;
const HASH_KEY_1: u64 = 0x7661_6c69_6461_7465;

/// Stable content hash of a byte blob.
pub fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(HASH_KEY_0, HASH_KEY_1);
    hasher.write(bytes);
    hasher.finish()
}

/// Fold a value into an accumulated hash.
pub fn combine_hash(hash: &mut u64, value: u64) {
    *hash ^= value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(*hash << 6)
        .wrapping_add(*hash >> 2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }

    #[test]
    fn test_combine_order_matters() {
        let mut a = 0u64;
        combine_hash(&mut a, 1);
        combine_hash(&mut a, 2);

        let mut b = 0u64;
        combine_hash(&mut b, 2);
        combine_hash(&mut b, 1);

        assert_ne!(a, b);
    }
}
