//! Property key naming shared with every other reader of the store file.

use crate::address::strip_resource;

pub const VERSION_KEY: &str = "version";
pub const PRIVATE_KEY_SUFFIX: &str = ".privateKey";
pub const PUBLIC_KEY_SUFFIX: &str = ".publicKey";
pub const FINGERPRINT_SUFFIX: &str = ".fingerprint";
pub const VERIFIED_SUFFIX: &str = ".publicKey.verified";

pub fn private_key(account_id: &str) -> String {
    format!("{account_id}{PRIVATE_KEY_SUFFIX}")
}

pub fn public_key(id: &str) -> String {
    format!("{id}{PUBLIC_KEY_SUFFIX}")
}

pub fn fingerprint(id: &str) -> String {
    format!("{id}{FINGERPRINT_SUFFIX}")
}

/// `<bare user>.<hex fingerprint>.publicKey.verified`; the resource is dropped
/// so a decision covers every endpoint presenting the same key.
pub fn verified(user_id: &str, fingerprint_hex: &str) -> String {
    format!(
        "{}.{}{VERIFIED_SUFFIX}",
        strip_resource(user_id),
        fingerprint_hex.to_ascii_lowercase()
    )
}
