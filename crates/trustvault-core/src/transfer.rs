//! Moving a key store between devices.
//!
//! An incoming file is decrypted into a throwaway map and merged into the live
//! store in one transaction. The format follows the file name: `.ofcaes` is
//! the legacy direct-AES transfer, anything else is a regular container.

use crate::codec::StoreFormat;
use crate::error::{KeyStoreError, Result};
use crate::paths::TRANSFER_FILE;
use crate::store::{self, KeyStore};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Entries written into the live store.
    pub imported: usize,
    /// Entries kept at their existing live value.
    pub skipped: usize,
}

impl KeyStore {
    /// Merges the store at `path` into this one. Absent keys are always
    /// copied; keys already present are replaced only with
    /// `overwrite_existing`. The source file is deleted afterwards when
    /// `delete_after_import` is set and the merge succeeded. Legacy `.ofcaes`
    /// sources follow the flag too; the pairing flow that must consume them
    /// is [`KeyStore::import_with_transfer_password`].
    pub fn import(
        &self,
        path: &Path,
        password: &str,
        overwrite_existing: bool,
        delete_after_import: bool,
    ) -> Result<ImportSummary> {
        let format = StoreFormat::from_path(path);
        let incoming = match store::read_file(path, password, format)? {
            Some((props, _)) => props,
            None => {
                return Err(KeyStoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("nothing to import at {}", path.display()),
                )))
            }
        };

        let summary = self.transaction(|tx| {
            let mut summary = ImportSummary::default();
            for (key, value) in &incoming {
                if overwrite_existing || !tx.contains(key) {
                    tx.set_string(key, value);
                    summary.imported += 1;
                } else {
                    summary.skipped += 1;
                }
            }
            Ok(summary)
        })?;
        info!(
            "imported {} entries ({} kept) from {} as {:?}",
            summary.imported,
            summary.skipped,
            path.display(),
            format
        );

        if delete_after_import {
            if let Err(e) = fs::remove_file(path) {
                warn!("imported {} but could not delete it: {e}", path.display());
            }
        }
        Ok(summary)
    }

    /// The device-pairing flow: the scanned password is cleaned up, the
    /// transfer wins over local values, and the transfer file is consumed.
    pub fn import_with_transfer_password(&self, path: &Path, scanned: &str) -> Result<ImportSummary> {
        self.import(path, &sanitize_transfer_password(scanned), true, true)
    }

    /// Exports to the conventional transfer file inside `dir`, in the legacy
    /// format its name announces so the receiving side can import it.
    pub fn export_to_dir(&self, password: &str, dir: &Path) -> Result<PathBuf> {
        let target = dir.join(TRANSFER_FILE);
        self.export_as(password, &target, StoreFormat::from_path(&target))?;
        Ok(target)
    }
}

/// A transfer file waiting in `dir`, if any.
pub fn pending_import(dir: &Path) -> Option<PathBuf> {
    let candidate = dir.join(TRANSFER_FILE);
    candidate.is_file().then_some(candidate)
}

/// Scanned codes may carry line breaks.
pub fn sanitize_transfer_password(raw: &str) -> String {
    raw.chars().filter(|c| *c != '\n' && *c != '\r').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::properties::{self, PropertyMap};
    use tempfile::tempdir;

    fn live_store(dir: &Path) -> KeyStore {
        let store = KeyStore::open_path(&dir.join("live.ofc"), "live").unwrap();
        store.set_string("shared", "live-value").unwrap();
        store.set_string("live.only", "1").unwrap();
        store
    }

    fn foreign_container(dir: &Path) -> PathBuf {
        let foreign = KeyStore::open_path(&dir.join("foreign.ofc"), "transfer").unwrap();
        foreign.set_string("shared", "foreign-value").unwrap();
        foreign.set_string("foreign.only", "2").unwrap();
        dir.join("foreign.ofc")
    }

    #[test]
    fn import_keeps_live_values_unless_overwriting() {
        let dir = tempdir().unwrap();
        let live = live_store(dir.path());
        let foreign = foreign_container(dir.path());

        let summary = live.import(&foreign, "transfer", false, false).unwrap();
        assert_eq!(summary, ImportSummary { imported: 1, skipped: 1 });
        assert_eq!(live.get_string("shared").as_deref(), Some("live-value"));
        assert_eq!(live.get_string("foreign.only").as_deref(), Some("2"));
        assert!(foreign.exists());

        live.import(&foreign, "transfer", true, true).unwrap();
        assert_eq!(live.get_string("shared").as_deref(), Some("foreign-value"));
        assert_eq!(live.get_string("live.only").as_deref(), Some("1"));
        assert!(!foreign.exists());
    }

    #[test]
    fn legacy_transfer_file_is_selected_by_extension() {
        let dir = tempdir().unwrap();
        let live = live_store(dir.path());
        let mut map = PropertyMap::new();
        map.insert("shared".into(), "from-legacy".into());
        let data = codec::encrypt_legacy(properties::serialize(&map).as_bytes(), "scan").unwrap();
        let path = dir.path().join(TRANSFER_FILE);
        fs::write(&path, data).unwrap();

        assert_eq!(pending_import(dir.path()), Some(path.clone()));
        live.import_with_transfer_password(&path, "scan\r\n").unwrap();
        assert_eq!(live.get_string("shared").as_deref(), Some("from-legacy"));
        assert!(!path.exists());
        assert_eq!(pending_import(dir.path()), None);
    }

    #[test]
    fn legacy_source_is_kept_unless_deletion_is_requested() {
        let dir = tempdir().unwrap();
        let live = live_store(dir.path());
        let exported = live.export_to_dir("carry", &dir.path().join("usb")).unwrap();
        live.import(&exported, "carry", false, false).unwrap();
        assert!(exported.exists());
        live.import(&exported, "carry", false, true).unwrap();
        assert!(!exported.exists());
    }

    #[test]
    fn wrong_transfer_password_leaves_live_store_alone() {
        let dir = tempdir().unwrap();
        let live = live_store(dir.path());
        let foreign = foreign_container(dir.path());
        let before = live.snapshot();
        assert!(live.import(&foreign, "nope", true, true).is_err());
        assert_eq!(live.snapshot(), before);
        assert!(foreign.exists());
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempdir().unwrap();
        let live = live_store(dir.path());
        assert!(matches!(
            live.import(&dir.path().join("absent.ofc"), "pw", false, false),
            Err(KeyStoreError::Io(_))
        ));
    }

    #[test]
    fn export_to_dir_roundtrips_through_import() {
        let dir = tempdir().unwrap();
        let live = live_store(dir.path());
        let out = dir.path().join("usb");
        let exported = live.export_to_dir("carry", &out).unwrap();
        assert_eq!(exported, out.join(TRANSFER_FILE));

        let data = fs::read(&exported).unwrap();
        let plain = codec::decrypt_legacy(&data, "carry").unwrap();
        assert_eq!(properties::parse(&plain).unwrap(), live.snapshot());

        let other = KeyStore::open_path(&dir.path().join("other.ofc"), "other").unwrap();
        other.import(&exported, "carry", false, false).unwrap();
        assert_eq!(other.snapshot(), live.snapshot());
    }

    #[test]
    fn sanitizes_scanned_passwords() {
        assert_eq!(sanitize_transfer_password("ab\r\ncd\n"), "abcd");
    }
}
