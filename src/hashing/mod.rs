// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hash engine.
//!
//! Sources and destinations report different native hash algorithms, so a
//! file is validated against the source's algorithm while being written in
//! the destination's. Every hasher exposes the same incremental
//! [`ContentHasher`] contract, and [`HashingReader`] tees one read pass
//! through several of them at once.
//!
//! | Type | Algorithm |
//! |------|-----------|
//! | `MD5`, `SHA-1`, `SHA256`, `SHA512` | standard digests |
//! | `git-hash` | SHA-1 seeded with `blob {size}\0` |
//! | `FileSize` | byte count, 8 bytes little-endian |
//! | `quickXorHash` | 20-byte rotating XOR folded with the size |
//!
//! # Example
//!
//! ```
//! use dataset_sync::hashing::get_hasher;
//!
//! let mut hasher = get_hasher("md5", 0).unwrap();
//! hasher.update(b"abc");
//! assert_eq!(hasher.hex_sum(), "900150983cd24fb0d6963f7d28e17f72");
//! ```

mod file_size;
mod quick_xor;
mod reader;

pub use file_size::{decode_size, FileSizeHasher};
pub use quick_xor::QuickXorHasher;
pub use reader::HashingReader;

use std::fmt;
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Result, SyncError};

/// Declared remote hash that must not be verified.
pub const NOT_NEEDED: &str = "not needed";

/// Destination hash placeholder while a rehash is pending.
pub const UNKNOWN_HASH: &str = "?";

/// Hash value reported for types that cannot be computed from content.
pub const UNCOMPUTABLE_HASH: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashType {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    GitHash,
    QuickXorHash,
    FileSize,
    /// Timestamp reported by some sources in place of a hash.
    LastModified,
}

impl HashType {
    /// Canonical wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HashType::Md5 => "MD5",
            HashType::Sha1 => "SHA-1",
            HashType::Sha256 => "SHA256",
            HashType::Sha512 => "SHA512",
            HashType::GitHash => "git-hash",
            HashType::QuickXorHash => "quickXorHash",
            HashType::FileSize => "FileSize",
            HashType::LastModified => "last_modified",
        }
    }

    /// Whether a digest can be computed from file content.
    #[must_use]
    pub fn is_computable(&self) -> bool {
        !matches!(self, HashType::LastModified)
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashType::Md5),
            "sha-1" | "sha1" => Ok(HashType::Sha1),
            "sha256" | "sha-256" => Ok(HashType::Sha256),
            "sha512" | "sha-512" => Ok(HashType::Sha512),
            "git-hash" | "githash" => Ok(HashType::GitHash),
            "quickxorhash" => Ok(HashType::QuickXorHash),
            "filesize" => Ok(HashType::FileSize),
            "last_modified" | "lastmodified" => Ok(HashType::LastModified),
            _ => Err(SyncError::UnsupportedHashType(s.to_string())),
        }
    }
}

/// Case-insensitive comparison of two hash type names.
#[must_use]
pub fn same_hash_type(a: &str, b: &str) -> bool {
    match (a.parse::<HashType>(), b.parse::<HashType>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.eq_ignore_ascii_case(b),
    }
}

/// Incremental hash with a uniform write/sum/reset contract.
pub trait ContentHasher: Send {
    fn update(&mut self, data: &[u8]);

    /// Digest of everything written so far. Does not consume the state.
    fn sum(&self) -> Vec<u8>;

    /// Back to the initial state, including any seed.
    fn reset(&mut self);

    fn hex_sum(&self) -> String {
        hex::encode(self.sum())
    }
}

/// Adapter for any RustCrypto digest, optionally pre-seeded.
#[derive(Clone)]
pub struct DigestHasher<D> {
    digest: D,
    seed: Vec<u8>,
}

impl<D: Digest + Clone + Send> DigestHasher<D> {
    #[must_use]
    pub fn new() -> Self {
        Self::seeded(Vec::new())
    }

    #[must_use]
    pub fn seeded(seed: Vec<u8>) -> Self {
        let mut digest = D::new();
        Digest::update(&mut digest, &seed);
        Self { digest, seed }
    }
}

impl<D: Digest + Clone + Send> Default for DigestHasher<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Digest + Clone + Send> ContentHasher for DigestHasher<D> {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.digest, data);
    }

    fn sum(&self) -> Vec<u8> {
        self.digest.clone().finalize().to_vec()
    }

    fn reset(&mut self) {
        let mut digest = D::new();
        Digest::update(&mut digest, &self.seed);
        self.digest = digest;
    }
}

/// Git blob object id: SHA-1 over `blob {size}\0` followed by the content.
#[must_use]
pub fn git_blob_hasher(size: u64) -> DigestHasher<Sha1> {
    DigestHasher::seeded(format!("blob {size}\0").into_bytes())
}

/// Build a hasher for `hash_type`.
///
/// `known_size` seeds the git-blob header; callers that cannot know the size
/// up front must skip verification for `git-hash`.
pub fn get_hasher(hash_type: &str, known_size: u64) -> Result<Box<dyn ContentHasher>> {
    let hasher: Box<dyn ContentHasher> = match hash_type.parse::<HashType>()? {
        HashType::Md5 => Box::new(DigestHasher::<Md5>::new()),
        HashType::Sha1 => Box::new(DigestHasher::<Sha1>::new()),
        HashType::Sha256 => Box::new(DigestHasher::<Sha256>::new()),
        HashType::Sha512 => Box::new(DigestHasher::<Sha512>::new()),
        HashType::GitHash => Box::new(git_blob_hasher(known_size)),
        HashType::QuickXorHash => Box::new(QuickXorHasher::new()),
        HashType::FileSize => Box::new(FileSizeHasher::new()),
        HashType::LastModified => {
            return Err(SyncError::UnsupportedHashType(hash_type.to_string()))
        }
    };
    Ok(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_of(hash_type: &str, data: &[u8]) -> String {
        let mut h = get_hasher(hash_type, data.len() as u64).unwrap();
        h.update(data);
        h.hex_sum()
    }

    #[test]
    fn test_standard_vectors() {
        assert_eq!(hex_of("MD5", b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(hex_of("SHA-1", b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            hex_of("SHA256", b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex_of("SHA512", b"abc"),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn test_git_blob_vectors() {
        assert_eq!(
            hex_of("git-hash", b"hello world\n"),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
        assert_eq!(hex_of("git-hash", b""), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_git_blob_reset_keeps_seed() {
        let mut h = get_hasher("git-hash", 12).unwrap();
        h.update(b"garbage that will be discarded");
        h.reset();
        h.update(b"hello world\n");
        assert_eq!(h.hex_sum(), "3b18e512dba79e4c8300dd08aeb37f8e728b8dad");
    }

    #[test]
    fn test_sum_does_not_consume() {
        let mut h = get_hasher("sha256", 0).unwrap();
        h.update(b"a");
        let first = h.hex_sum();
        assert_eq!(first, h.hex_sum());
        h.update(b"bc");
        assert_eq!(h.hex_sum(), hex_of("SHA256", b"abc"));
    }

    #[test]
    fn test_hash_type_parsing_is_case_insensitive() {
        assert_eq!("md5".parse::<HashType>().unwrap(), HashType::Md5);
        assert_eq!("Sha1".parse::<HashType>().unwrap(), HashType::Sha1);
        assert_eq!("QUICKXORHASH".parse::<HashType>().unwrap(), HashType::QuickXorHash);
        assert_eq!("filesize".parse::<HashType>().unwrap(), HashType::FileSize);
        assert!(same_hash_type("sha256", "SHA-256"));
        assert!(!same_hash_type("MD5", "SHA-1"));
    }

    #[test]
    fn test_unsupported_types() {
        assert!(matches!(get_hasher("crc32", 0), Err(SyncError::UnsupportedHashType(_))));
        assert!(matches!(get_hasher("last_modified", 0), Err(SyncError::UnsupportedHashType(_))));
        assert!(!HashType::LastModified.is_computable());
    }

    #[test]
    fn test_canonical_names_roundtrip() {
        for t in [
            HashType::Md5,
            HashType::Sha1,
            HashType::Sha256,
            HashType::Sha512,
            HashType::GitHash,
            HashType::QuickXorHash,
            HashType::FileSize,
            HashType::LastModified,
        ] {
            assert_eq!(t.as_str().parse::<HashType>().unwrap(), t);
        }
    }
}
