use crate::paths::{LEGACY_STORE_FILE, SETTINGS_FILE, STORE_FILE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Where the store lives and how to unlock it.
#[derive(Clone)]
pub struct KeyStoreConfig {
    pub store_path: PathBuf,
    /// Unencrypted store from older releases, merged once by migration.
    pub legacy_path: Option<PathBuf>,
    pub password: Zeroizing<String>,
}

/// Optional `settings.json` overrides. The password is never read from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub legacy_path: Option<PathBuf>,
}

impl std::fmt::Debug for KeyStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStoreConfig")
            .field("store_path", &self.store_path)
            .field("legacy_path", &self.legacy_path)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl KeyStoreConfig {
    pub fn new(store_path: impl Into<PathBuf>, password: &str) -> Self {
        Self {
            store_path: store_path.into(),
            legacy_path: None,
            password: Zeroizing::new(password.to_string()),
        }
    }

    /// The conventional layout: encrypted store and legacy file side by side.
    pub fn in_dir(dir: impl AsRef<Path>, password: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            store_path: dir.join(STORE_FILE),
            legacy_path: Some(dir.join(LEGACY_STORE_FILE)),
            password: Zeroizing::new(password.to_string()),
        }
    }

    /// `in_dir` plus whatever `settings.json` in that directory overrides.
    pub fn load(dir: impl AsRef<Path>, password: &str) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut config = Self::in_dir(dir, password);
        let settings_path = dir.join(SETTINGS_FILE);
        if settings_path.exists() {
            let data = std::fs::read_to_string(&settings_path)?;
            let settings: StoreSettings = serde_json::from_str(&data)
                .map_err(|e| anyhow::anyhow!("parse {}: {e}", settings_path.display()))?;
            if let Some(path) = settings.store_path {
                config.store_path = path;
            }
            if settings.legacy_path.is_some() {
                config.legacy_path = settings.legacy_path;
            }
        }
        Ok(config)
    }

    pub fn with_legacy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_path = Some(path.into());
        self
    }
}
