//! One-time schema upgrades, run by [`KeyStore::open`] before the store is
//! handed out.

use crate::error::{KeyStoreError, Result};
use crate::properties;
use crate::schema::{self, FINGERPRINT_SUFFIX, VERSION_KEY};
use crate::store::KeyStore;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for SchemaVersion {
    type Err = KeyStoreError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in s.trim().split('.') {
            if count == parts.len() {
                return Err(KeyStoreError::Encoding(format!("version {s:?} has too many parts")));
            }
            parts[count] = piece
                .parse()
                .map_err(|_| KeyStoreError::Encoding(format!("version {s:?} is not numeric")))?;
            count += 1;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

pub const CURRENT_VERSION: SchemaVersion = SchemaVersion::new(2, 0, 0);
/// Stores older than this predate verification tokens and the encrypted file.
pub const TOFU_THRESHOLD: SchemaVersion = SchemaVersion::new(1, 0, 0);

pub fn stored_version(store: &KeyStore) -> Option<SchemaVersion> {
    store.get_string(VERSION_KEY)?.parse().ok()
}

/// Upgrades `store` if its version is missing or below [`TOFU_THRESHOLD`].
/// Returns whether an upgrade completed. A failed legacy merge is logged and
/// leaves the version unbumped so the next open retries it.
pub fn upgrade(store: &KeyStore, legacy_path: Option<&Path>) -> Result<bool> {
    let version = stored_version(store);
    if matches!(version, Some(v) if v >= TOFU_THRESHOLD) {
        return Ok(false);
    }
    info!(
        "upgrading key store schema from {} to {}",
        version.map_or_else(|| "none".to_string(), |v| v.to_string()),
        CURRENT_VERSION
    );

    let seeded = backfill_verification_tokens(store)?;
    if seeded > 0 {
        info!("seeded {seeded} unverified tokens for known fingerprints");
    }

    if let Some(legacy) = legacy_path.filter(|p| p.exists()) {
        if let Err(e) = merge_legacy_store(store, legacy) {
            warn!("legacy key store merge from {} failed: {e}", legacy.display());
            return Ok(false);
        }
    }

    store.set_string(VERSION_KEY, &CURRENT_VERSION.to_string())?;
    Ok(true)
}

/// Every cached fingerprint gets a `false` token unless a decision exists.
fn backfill_verification_tokens(store: &KeyStore) -> Result<usize> {
    store.transaction(|tx| {
        let mut seeded = 0;
        for key in tx.keys() {
            let Some(full_user_id) = key.strip_suffix(FINGERPRINT_SUFFIX) else {
                continue;
            };
            let Some(fingerprint) = tx.get_string(&key).map(str::to_string) else {
                continue;
            };
            let token = schema::verified(full_user_id, &fingerprint);
            if !tx.contains(&token) {
                tx.set_bool(&token, false);
                seeded += 1;
            }
        }
        Ok(seeded)
    })
}

/// Copies every entry of the unencrypted legacy file over the live store,
/// then deletes the legacy file.
fn merge_legacy_store(store: &KeyStore, legacy: &Path) -> Result<()> {
    let data = fs::read(legacy)?;
    let legacy_props = properties::parse(&data)?;
    let count = legacy_props.len();
    store.transaction(|tx| {
        for (key, value) in &legacy_props {
            tx.set_string(key, value);
        }
        Ok(())
    })?;
    fs::remove_file(legacy)?;
    info!("merged {count} entries from legacy key store {}", legacy.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyStoreConfig;
    use tempfile::tempdir;

    #[test]
    fn version_parsing_and_ordering() {
        assert_eq!("2.0.0".parse::<SchemaVersion>().unwrap(), CURRENT_VERSION);
        assert_eq!("1".parse::<SchemaVersion>().unwrap(), TOFU_THRESHOLD);
        assert!("0.9.9".parse::<SchemaVersion>().unwrap() < TOFU_THRESHOLD);
        assert!("1.0.1".parse::<SchemaVersion>().unwrap() > TOFU_THRESHOLD);
        assert!("1.x".parse::<SchemaVersion>().is_err());
        assert!("1.2.3.4".parse::<SchemaVersion>().is_err());
    }

    #[test]
    fn backfills_tokens_without_overwriting_decisions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.ofc");
        {
            let raw = KeyStore::open_path(&path, "pw").unwrap();
            raw.set_string("bob@example.com/phone.fingerprint", "aa11").unwrap();
            raw.set_string("carol@example.com/pc.fingerprint", "bb22").unwrap();
            raw.set_bool("carol@example.com.bb22.publicKey.verified", true).unwrap();
        }
        let store = KeyStore::open(&KeyStoreConfig::new(&path, "pw")).unwrap();
        assert_eq!(
            store.get_string("bob@example.com.aa11.publicKey.verified").as_deref(),
            Some("false")
        );
        assert!(store.get_bool("carol@example.com.bb22.publicKey.verified", false));
        assert_eq!(stored_version(&store), Some(CURRENT_VERSION));
    }

    #[test]
    fn merges_and_deletes_legacy_store() {
        let dir = tempdir().unwrap();
        let legacy = dir.path().join("otr_keystore");
        fs::write(&legacy, "shared=legacy\nold.only=1\n").unwrap();
        {
            let raw = KeyStore::open_path(&dir.path().join("otr_keystore.ofc"), "pw").unwrap();
            raw.set_string("shared", "current").unwrap();
        }
        let store = KeyStore::open(&KeyStoreConfig::in_dir(dir.path(), "pw")).unwrap();
        assert_eq!(store.get_string("shared").as_deref(), Some("legacy"));
        assert_eq!(store.get_string("old.only").as_deref(), Some("1"));
        assert!(!legacy.exists());
    }

    #[test]
    fn failed_legacy_merge_retries_next_open() {
        let dir = tempdir().unwrap();
        let legacy = dir.path().join("otr_keystore");
        fs::write(&legacy, [0xffu8, 0xfe, 0x00]).unwrap();
        let config = KeyStoreConfig::in_dir(dir.path(), "pw");

        let store = KeyStore::open(&config).unwrap();
        assert_eq!(stored_version(&store), None);
        assert!(legacy.exists());
        drop(store);

        fs::write(&legacy, "recovered=yes\n").unwrap();
        let store = KeyStore::open(&config).unwrap();
        assert_eq!(store.get_string("recovered").as_deref(), Some("yes"));
        assert_eq!(stored_version(&store), Some(CURRENT_VERSION));
    }

    #[test]
    fn current_store_is_not_migrated_again() {
        let dir = tempdir().unwrap();
        let config = KeyStoreConfig::in_dir(dir.path(), "pw");
        let store = KeyStore::open(&config).unwrap();
        store.set_string("bob@example.com/phone.fingerprint", "aa11").unwrap();
        drop(store);

        // a legacy file appearing later is ignored, and no token is seeded
        let legacy = config.legacy_path.clone().unwrap();
        fs::write(&legacy, "late=1\n").unwrap();
        let store = KeyStore::open(&config).unwrap();
        assert!(!store.contains("late"));
        assert!(!store.contains("bob@example.com.aa11.publicKey.verified"));
        assert!(legacy.exists());
        assert!(!upgrade(&store, Some(&legacy)).unwrap());
    }
}
