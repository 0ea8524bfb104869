//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use dsa::Components;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use trustvault_core::{
    DsaEngine, KeyManager, KeyManagerListener, KeyStore, KeyStoreConfig, VerificationChange,
};

pub const PASSWORD: &str = "correct horse battery staple";

/// DSA parameter generation is slow; every test in a binary shares one set.
pub fn components() -> Components {
    static COMPONENTS: OnceLock<Components> = OnceLock::new();
    COMPONENTS
        .get_or_init(DsaEngine::generate_components)
        .clone()
}

pub fn engine() -> DsaEngine {
    DsaEngine::with_components(components())
}

pub fn open_manager(dir: &Path) -> KeyManager {
    let store = KeyStore::open(&KeyStoreConfig::in_dir(dir, PASSWORD)).unwrap();
    KeyManager::with_engine(Arc::new(store), engine())
}

#[derive(Default)]
pub struct RecordingListener {
    pub changes: parking_lot::Mutex<Vec<VerificationChange>>,
    pub remote_verified: AtomicUsize,
}

impl RecordingListener {
    pub fn count(&self) -> usize {
        self.changes.lock().len()
    }
}

impl KeyManagerListener for RecordingListener {
    fn verification_status_changed(&self, change: &VerificationChange) {
        self.changes.lock().push(change.clone());
    }

    fn remote_verified_us(&self, _session: &trustvault_core::SessionId) {
        self.remote_verified.fetch_add(1, Ordering::SeqCst);
    }
}
