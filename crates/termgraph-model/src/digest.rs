//! Stable identifiers and content digests.
//!
//! Two hashes are used, for two different jobs:
//!
//! - **Concept ids** are derived with SHA-256 over `(vocabulary, native_code)`.
//!   They are persisted, exported to the serving layer and keyed on by the
//!   vector store, so they use a cryptographic hash truncated to 128 bits.
//! - **Content digests** (slice digests, payload digests) use FNV-1a 64-bit.
//!   They only compare a release or a compiled slice against the previous
//!   one and are never exported.
//!
//! Output encodings are versioned by prefix so a future change of either
//! algorithm is detectable in stored data.

use sha2::{Digest, Sha256};

/// Prefix used in serialized concept ids.
pub const CONCEPT_ID_V1_PREFIX: &str = "tg1:";

/// Prefix used in serialized content digests (FNV-1a 64-bit).
pub const CONTENT_DIGEST_V1_PREFIX: &str = "fnv1a64:";

/// Prefix used in serialized payload checksums.
pub const SHA256_PREFIX: &str = "sha256:";

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001b3;

/// Compute a v1 content digest (FNV-1a 64-bit) over arbitrary bytes.
pub fn fnv1a64_digest_bytes(bytes: &[u8]) -> String {
    let mut hash = FNV_OFFSET_BASIS;
    for b in bytes {
        hash ^= (*b) as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    format!("{CONTENT_DIGEST_V1_PREFIX}{hash:016x}")
}

/// Compute a `sha256:<hex>` checksum over arbitrary bytes.
///
/// Used for release payload checksums declared in configuration.
pub fn sha256_checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{SHA256_PREFIX}{}", hex_lower(&digest))
}

/// Derive the v1 concept id digest for `(vocabulary, native_code)`.
///
/// Fields are separated by the ASCII unit separator so that
/// `("AB", "C")` and `("A", "BC")` never collide.
pub(crate) fn concept_id_v1(vocabulary: &str, native_code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"vocabulary=");
    hasher.update(vocabulary.as_bytes());
    hasher.update([0x1f]);
    hasher.update(b"code=");
    hasher.update(native_code.as_bytes());
    let digest = hasher.finalize();

    format!("{CONCEPT_ID_V1_PREFIX}{}", hex_lower(&digest[..16]))
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_has_expected_prefix_and_width() {
        let d = fnv1a64_digest_bytes(b"HGNC:1100\tBRCA1\n");
        assert!(d.starts_with(CONTENT_DIGEST_V1_PREFIX));
        assert_eq!(d.len(), CONTENT_DIGEST_V1_PREFIX.len() + 16);
    }

    #[test]
    fn concept_id_has_expected_prefix_and_width() {
        let id = concept_id_v1("HGNC", "HGNC:1100");
        assert!(id.starts_with(CONCEPT_ID_V1_PREFIX));
        assert_eq!(id.len(), CONCEPT_ID_V1_PREFIX.len() + 32);
    }

    #[test]
    fn concept_id_separates_fields() {
        assert_ne!(concept_id_v1("AB", "C"), concept_id_v1("A", "BC"));
    }

    #[test]
    fn sha256_checksum_matches_known_vector() {
        assert_eq!(
            sha256_checksum(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
