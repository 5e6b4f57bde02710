// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bearer token generation, hashing, and constant-time verification.
//!
//! The raw token is shown to the operator exactly once, at generation time.
//! Only its SHA-256 hash is ever written to disk or kept resident in memory
//! for the lifetime of the process.

use std::{
    fs,
    path::Path,
};

use anyhow::Context;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const TOKEN_BYTES: usize = 32;

/// A freshly generated, not-yet-hashed token. Exists only long enough to be
/// displayed to the operator and hashed into a [`StoredToken`].
pub struct RawToken(String);

impl RawToken {
    /// Generate a new random token, hex-encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hash this token for storage. The raw value is dropped afterward.
    pub fn into_stored(self) -> StoredToken {
        StoredToken::hash(&self.0)
    }
}

/// SHA-256 hash of a bearer token, safe to persist and compare against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    hash_hex: String,
}

impl StoredToken {
    fn hash(raw: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        Self { hash_hex: hex::encode(hasher.finalize()) }
    }

    /// Verify a candidate token in constant time (w.r.t. the hash bytes —
    /// hashing itself is not constant-time, but that leaks nothing an
    /// attacker doesn't already know about SHA-256).
    pub fn verify(&self, candidate: &str) -> bool {
        let candidate_hash = Self::hash(candidate);
        let a = self.hash_hex.as_bytes();
        let b = candidate_hash.hash_hex.as_bytes();
        a.len() == b.len() && bool::from(a.ct_eq(b))
    }
}

/// On-disk representation of `token.yaml`: just the stored hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokenFile {
    pub token_hash: StoredToken,
}

impl StoredTokenFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading token file {}", path.display()))?;
        serde_yaml::from_str(&contents).context("parsing token file")
    }

    /// Generate a new token, persist its hash to `path` (mode 0600 on unix),
    /// and return the raw token so the caller can display it once.
    pub fn generate_and_save(path: &Path) -> anyhow::Result<RawToken> {
        let raw = RawToken::generate();
        let stored = StoredToken::hash(raw.as_str());
        let file = StoredTokenFile { token_hash: stored };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(&file).context("serializing token file")?;
        fs::write(path, yaml).with_context(|| format!("writing token file {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("chmod 0600 on {}", path.display()))?;
        }

        Ok(raw)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_token_is_hex_and_nonempty() {
        let t = RawToken::generate();
        assert_eq!(t.as_str().len(), TOKEN_BYTES * 2);
        assert!(t.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn two_generated_tokens_differ() {
        assert_ne!(RawToken::generate().as_str(), RawToken::generate().as_str());
    }

    #[test]
    fn stored_token_verifies_matching_raw() {
        let raw = RawToken::generate();
        let raw_str = raw.as_str().to_string();
        let stored = raw.into_stored();
        assert!(stored.verify(&raw_str));
    }

    #[test]
    fn stored_token_rejects_wrong_raw() {
        let stored = RawToken::generate().into_stored();
        assert!(!stored.verify("wrong"));
    }

    #[test]
    fn save_then_load_round_trips_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        let raw = StoredTokenFile::generate_and_save(&path).unwrap();
        let loaded = StoredTokenFile::load(&path).unwrap();
        assert!(loaded.token_hash.verify(raw.as_str()));
    }

    #[cfg(unix)]
    #[test]
    fn saved_token_file_is_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.yaml");
        StoredTokenFile::generate_and_save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
