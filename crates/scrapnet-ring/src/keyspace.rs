//! The circular identifier space shared by nodes and keys.
//!
//! Identifiers live in `[0, 2^M)`. Node IPs and string keys (URLs,
//! usernames) are hashed onto the same ring, and a key is owned by the
//! node whose identifier is the modular-least identifier not less than
//! the key's.

use sha1::{Digest, Sha1};

/// Number of bits in the identifier space.
pub const M: u32 = 32;

/// Identifier on the ring, always `< 2^M`.
pub type KeyId = u64;

/// Size of the identifier space (`2^M`).
pub const RING_SIZE: u64 = 1 << M;

/// Hash a string onto the ring.
///
/// The top 64 bits of the SHA-1 digest, read big-endian, reduced mod `2^M`.
/// The same function assigns node identifiers (from IPs) and key
/// identifiers (from URLs and usernames).
#[must_use]
pub fn hash_key(key: &str) -> KeyId {
    let digest = Sha1::digest(key.as_bytes());
    let mut top = [0u8; 8];
    top.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(top) % RING_SIZE
}

/// Modular half-open arc membership: `k ∈ (start, end]` on the ring.
///
/// When `start == end` the arc covers the whole ring: every `k` is
/// inside, which is what a solo node expects.
#[must_use]
pub fn between(k: KeyId, start: KeyId, end: KeyId) -> bool {
    if start < end {
        start < k && k <= end
    } else {
        k > start || k <= end
    }
}

/// Start position of finger `i` for a node: `(id + 2^i) mod 2^M`.
#[must_use]
pub fn finger_start(id: KeyId, i: u32) -> KeyId {
    (id + (1u64 << i)) % RING_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hash_is_deterministic_and_in_range() {
        for key in ["127.0.0.1", "http://example.com/", "alice", ""] {
            let h = hash_key(key);
            assert_eq!(h, hash_key(key));
            assert!(h < RING_SIZE);
        }
    }

    #[test]
    fn hash_matches_reference_values() {
        // SHA-1 top 64 bits mod 2^32, computed independently.
        assert_eq!(hash_key("127.0.0.1"), 4_285_457_785);
        assert_eq!(hash_key("http://example.com/"), 4_119_826_976);
        assert_eq!(hash_key("alice"), 896_261_945);
    }

    #[test]
    fn between_simple_arc() {
        assert!(between(5, 1, 10));
        assert!(between(10, 1, 10));
        assert!(!between(1, 1, 10));
        assert!(!between(11, 1, 10));
    }

    #[test]
    fn between_wrapping_arc() {
        // Arc (4000000000, 17] wraps through zero.
        assert!(between(4_100_000_000, 4_000_000_000, 17));
        assert!(between(0, 4_000_000_000, 17));
        assert!(between(17, 4_000_000_000, 17));
        assert!(!between(18, 4_000_000_000, 17));
        assert!(!between(3_999_999_999, 4_000_000_000, 17));
    }

    #[test]
    fn degenerate_arc_covers_whole_ring() {
        // A solo node owns every key.
        for k in [0, 1, 42, RING_SIZE - 1] {
            assert!(between(k, 7, 7) || k == 7);
        }
    }

    #[test]
    fn finger_start_wraps() {
        assert_eq!(finger_start(RING_SIZE - 1, 0), 0);
        assert_eq!(finger_start(0, 31), 1 << 31);
        assert_eq!(finger_start(RING_SIZE - 1, 31), (1 << 31) - 1);
    }

    proptest! {
        /// For distinct a, b and k outside {a, b}, k lies on exactly one
        /// of the two arcs (a, b] and (b, a].
        #[test]
        fn between_partitions_the_ring(
            a in 0..RING_SIZE,
            b in 0..RING_SIZE,
            k in 0..RING_SIZE,
        ) {
            prop_assume!(a != b && k != a && k != b);
            prop_assert!(between(k, a, b) ^ between(k, b, a));
        }

        #[test]
        fn hash_stays_in_range(s in ".*") {
            prop_assert!(hash_key(&s) < RING_SIZE);
        }
    }
}
