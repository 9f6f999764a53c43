//! Interface identity hashing
//!
//! An interface identity is the first 128 bits of the SHA-256 digest of a
//! platform-specific interface locator, rendered as lowercase hex. The
//! locator is stable within a platform, so the same physical interface
//! always maps back to the same identity.

use sha2::{Digest, Sha256};

/// Digest bytes kept for an identity (128 bits, 32 hex chars).
const IDENTITY_BYTES: usize = 16;

/// Compute the stable identity for an interface locator.
pub fn interface_identity(locator: &str) -> String {
    let digest = Sha256::digest(locator.as_bytes());
    digest[..IDENTITY_BYTES]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
