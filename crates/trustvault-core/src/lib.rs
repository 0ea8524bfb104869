//! trustvault-core: encrypted identity-key and trust store for OTR messaging
//!
//! # Storage
//! Everything lives in one property map, encrypted as a whole with an
//! OpenSSL-compatible AES-256-CBC container and replaced atomically on every
//! committed change. There is no partial update and no journal.
//!
//! # Trust model
//! Remote keys are trusted on first use only in the sense that they are
//! remembered; a verification token is created `false` and flipped to `true`
//! solely by an explicit verify call.
//!
//! # Module layout
//! - `codec`       container and legacy transfer encryption
//! - `properties`  the plaintext property-list format
//! - `store`       the encrypted store, transactions, reload, export
//! - `transfer`    device-to-device import/export
//! - `migration`   schema versioning and legacy file merge
//! - `engine`      DSA key generation, encodings, fingerprints
//! - `manager`     local/remote keys, verification, listeners
//! - `sync`        reload-on-change watcher for shared store files

pub mod address;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod migration;
pub mod paths;
pub mod properties;
pub mod schema;
pub mod store;
pub mod sync;
pub mod transfer;

pub use address::SessionId;
pub use config::KeyStoreConfig;
pub use engine::{CryptoEngine, DsaEngine, Fingerprint};
pub use error::KeyStoreError;
pub use manager::{KeyManager, KeyManagerListener, VerificationChange};
pub use store::KeyStore;
pub use sync::StoreWatcher;
pub use transfer::ImportSummary;
