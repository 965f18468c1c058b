//! Deterministic batch reference derivation for replay framing.

use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Derive a stable batch reference from a conversation target's name.
///
/// The same target always yields the same reference, across replays and
/// across processes, so a reconnecting client can correlate playback
/// batches. Returns the first 16 hex characters of SHA-256(target).
pub fn batch_ref_for(target: &str) -> String {
    let digest = Sha256::digest(target.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        // Writing to a String cannot fail
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_ref_is_deterministic() {
        assert_eq!(batch_ref_for("#rust"), batch_ref_for("#rust"));
    }

    #[test]
    fn batch_ref_distinct_per_target() {
        assert_ne!(batch_ref_for("#rust"), batch_ref_for("#rust-beginners"));
        assert_ne!(batch_ref_for("#rust"), batch_ref_for("#Rust"));
    }

    #[test]
    fn batch_ref_shape() {
        let r = batch_ref_for("alice");
        assert_eq!(r.len(), 16);
        assert!(r.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
