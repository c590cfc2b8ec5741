//! Content fingerprinting for deduplication.
//!
//! Defines the [`ContentHasher`] trait and two implementations:
//! - **[`Sha256Hasher`]**: cryptographic digest, the default.
//! - **[`FallbackHasher`]**: non-cryptographic FNV-1a rolling hash plus
//!   length, for environments without a crypto primitive.
//!
//! Every produced value carries an algorithm prefix (`sha256:` or `weak:`)
//! so stored hashes reveal which guarantee applied; the two families can
//! never collide with each other. Input is trimmed before hashing so
//! leading/trailing whitespace does not cause spurious distinctness.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Inputs larger than this are hashed off the async executor.
const INLINE_HASH_LIMIT: usize = 64 * 1024;

/// Computes a stable, deterministic content fingerprint.
///
/// `hash` is asynchronous regardless of backend so large inputs never block
/// the caller's event loop.
#[async_trait]
pub trait ContentHasher: Send + Sync {
    /// Returns the algorithm tag used as the value prefix (e.g. `"sha256"`).
    fn algorithm(&self) -> &str;

    /// Hash the trimmed content into a prefixed fingerprint string.
    async fn hash(&self, content: &str) -> Result<String>;
}

/// SHA-256 content hasher. Values look like `sha256:<hex>`.
pub struct Sha256Hasher;

#[async_trait]
impl ContentHasher for Sha256Hasher {
    fn algorithm(&self) -> &str {
        "sha256"
    }

    async fn hash(&self, content: &str) -> Result<String> {
        let trimmed = content.trim();
        if trimmed.len() > INLINE_HASH_LIMIT {
            let owned = trimmed.to_string();
            let digest =
                tokio::task::spawn_blocking(move || sha256_hex(&owned)).await?;
            Ok(format!("sha256:{}", digest))
        } else {
            Ok(format!("sha256:{}", sha256_hex(trimmed)))
        }
    }
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Non-cryptographic fallback hasher. Values look like `weak:<hex>-<len>`.
///
/// Collision-resistant enough for dedup of human-sized fragments, but not
/// secure; the `weak:` prefix keeps that visible in persisted data.
pub struct FallbackHasher;

#[async_trait]
impl ContentHasher for FallbackHasher {
    fn algorithm(&self) -> &str {
        "weak"
    }

    async fn hash(&self, content: &str) -> Result<String> {
        Ok(weak_fingerprint(content))
    }
}

/// Synchronous weak fingerprint, also used to backfill hashes for legacy
/// snapshot records that predate the `content_hash` field.
pub fn weak_fingerprint(content: &str) -> String {
    let trimmed = content.trim();
    format!("weak:{:016x}-{}", fnv1a64(trimmed), trimmed.chars().count())
}

fn fnv1a64(text: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
