//! Permutation seed derivation
//!
//! Every server gets a stable byte string that placement logic uses as its
//! position key in a per-file ordering. The seed is derived once from the
//! first announcement seen for a server id:
//!
//! 1. an explicit `permutation-seed-base32` field, decoded
//! 2. the key material of a `v0-<base32 pubkey>` server id, decoded
//! 3. SHA-256 of the raw server id bytes

use crate::announcement::{Announcement, ServerId};
use crate::error::{FarmError, Result};
use bytes::Bytes;
use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};
use std::fmt;

/// Decode unpadded RFC 4648 base32 (either case)
pub fn base32_decode(encoded: &str) -> Result<Bytes> {
    BASE32_NOPAD
        .decode(encoded.to_ascii_uppercase().as_bytes())
        .map(Bytes::from)
        .map_err(|e| FarmError::InvalidBase32(format!("{encoded:?}: {e}")))
}

/// Encode as lowercase unpadded base32
pub fn base32_encode(data: &[u8]) -> String {
    BASE32_NOPAD.encode(data).to_ascii_lowercase()
}

/// Where a permutation seed came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedSource {
    /// `permutation-seed-base32` in the announcement
    Announced,
    /// Public key embedded in the server id
    PublicKey,
    /// SHA-256 of the server id
    Hashed,
}

/// Stable per-server placement key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PermutationSeed(Bytes);

impl PermutationSeed {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Derive the seed for `server_id` from its first announcement.
    ///
    /// An explicit seed field that does not decode is an error; the caller
    /// decides how to record the server.
    pub fn derive(server_id: &ServerId, ann: &Announcement) -> Result<(Self, SeedSource)> {
        if let Some(encoded) = ann.permutation_seed_base32.as_deref() {
            let seed = base32_decode(encoded).map_err(|e| {
                FarmError::malformed(server_id, format!("permutation-seed-base32: {e}"))
            })?;
            return Ok((Self(seed), SeedSource::Announced));
        }
        Ok(Self::derive_from_id(server_id))
    }

    /// Derive the seed from the server id alone (steps 2 and 3)
    pub fn derive_from_id(server_id: &ServerId) -> (Self, SeedSource) {
        if let Some(key) = server_id.public_key_base32() {
            if let Ok(seed) = base32_decode(key) {
                return (Self(seed), SeedSource::PublicKey);
            }
        }
        (
            Self(Bytes::copy_from_slice(&Sha256::digest(server_id.as_bytes()))),
            SeedSource::Hashed,
        )
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base32(&self) -> String {
        base32_encode(&self.0)
    }
}

impl fmt::Debug for PermutationSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PermutationSeed({})", self.to_base32())
    }
}

impl AsRef<[u8]> for PermutationSeed {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
