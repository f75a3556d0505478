//! Content fingerprint and similarity signature
//!
//! The fingerprint is a SHA-256 digest and identifies exact duplicates. The
//! signature is a 64-bit average hash: the payload is split into 64 equal
//! buckets and bit `i` is set when bucket `i`'s mean byte value is at least
//! the payload's overall mean. Two payloads whose bytes differ only slightly
//! keep most bits, so the normalized Hamming distance approximates
//! dissimilarity.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SIGNATURE_BITS: usize = 64;

/// SHA-256 digest of a frame payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn of(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Coarse 64-bit similarity signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub u64);

impl Signature {
    pub fn of(payload: &[u8]) -> Self {
        if payload.is_empty() {
            return Self(0);
        }

        let len = payload.len();
        let mut means = [0f64; SIGNATURE_BITS];
        for (i, mean) in means.iter_mut().enumerate() {
            let start = i * len / SIGNATURE_BITS;
            let end = ((i + 1) * len / SIGNATURE_BITS).max(start + 1).min(len);
            let start = start.min(len - 1);
            let bucket = &payload[start..end];
            let sum: u64 = bucket.iter().map(|&b| b as u64).sum();
            *mean = sum as f64 / bucket.len() as f64;
        }

        let overall = payload.iter().map(|&b| b as u64).sum::<u64>() as f64 / len as f64;

        let mut bits = 0u64;
        for (i, mean) in means.iter().enumerate() {
            if *mean >= overall {
                bits |= 1 << i;
            }
        }
        Self(bits)
    }

    /// Normalized Hamming distance in `[0.0, 1.0]`.
    pub fn distance(&self, other: &Signature) -> f32 {
        (self.0 ^ other.0).count_ones() as f32 / SIGNATURE_BITS as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 255 / len.max(1)) as u8).collect()
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let a = Fingerprint::of(b"frame-a");
        assert_eq!(a, Fingerprint::of(b"frame-a"));
        assert_ne!(a, Fingerprint::of(b"frame-b"));
        assert_eq!(a.to_hex().len(), 64);
        assert_eq!(format!("{}", a).len(), 16);
    }

    #[test]
    fn identical_payloads_have_zero_distance() {
        let payload = ramp(4096);
        let s = Signature::of(&payload);
        assert_eq!(s.distance(&Signature::of(&payload)), 0.0);
    }

    #[test]
    fn small_perturbation_stays_close() {
        let original = ramp(4096);
        let mut tweaked = original.clone();
        tweaked[100] ^= 0x01;
        tweaked[3000] ^= 0x02;

        let d = Signature::of(&original).distance(&Signature::of(&tweaked));
        assert!(d <= 2.0 / 64.0, "distance {} too large", d);
        assert_ne!(Fingerprint::of(&original), Fingerprint::of(&tweaked));
    }

    #[test]
    fn inverted_payload_is_far() {
        let original = ramp(4096);
        let inverted: Vec<u8> = original.iter().map(|b| 255 - b).collect();
        let d = Signature::of(&original).distance(&Signature::of(&inverted));
        assert!(d > 0.9, "distance {} too small", d);
    }

    #[test]
    fn short_and_empty_payloads_do_not_panic() {
        assert_eq!(Signature::of(&[]), Signature(0));
        let tiny = Signature::of(&[1, 2, 3]);
        assert_eq!(tiny.distance(&Signature::of(&[1, 2, 3])), 0.0);
        let _ = Signature::of(&[42]);
    }
}
