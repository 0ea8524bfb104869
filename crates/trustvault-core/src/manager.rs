//! Identity keys and trust decisions on top of the encrypted store.
//!
//! Remote fingerprints and verification tokens are only meaningful for a
//! specific endpoint (`user@host/resource`); a bare account may have several
//! endpoints with different keys, so lookups on a bare id resolve to nothing.
//! Learning a key never trusts it: tokens start out `false` and only
//! [`KeyManager::verify`] and friends flip them.

use crate::address::{has_resource, strip_resource, SessionId};
use crate::config::KeyStoreConfig;
use crate::engine::{CryptoEngine, DsaEngine, Fingerprint};
use crate::error::{KeyStoreError, Result};
use crate::schema;
use crate::store::{KeyStore, Transaction};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A verification token that actually changed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationChange {
    pub full_user_id: String,
    pub fingerprint: Fingerprint,
    pub verified: bool,
    /// Set when the change came through a session-keyed call.
    pub session: Option<SessionId>,
}

/// Observers run on the caller's thread once the store lock is released.
/// Anything heavier than a quick store read belongs on another task.
pub trait KeyManagerListener: Send + Sync {
    fn verification_status_changed(&self, change: &VerificationChange);

    fn remote_verified_us(&self, _session: &SessionId) {}
}

pub struct KeyManager<E: CryptoEngine = DsaEngine> {
    store: Arc<KeyStore>,
    engine: E,
    listeners: Mutex<Vec<Arc<dyn KeyManagerListener>>>,
}

impl KeyManager<DsaEngine> {
    /// Opens and migrates the store described by `config`.
    pub fn open(config: &KeyStoreConfig) -> Result<Self> {
        Ok(Self::with_engine(Arc::new(KeyStore::open(config)?), DsaEngine::new()))
    }
}

impl<E: CryptoEngine> KeyManager<E> {
    pub fn with_engine(store: Arc<KeyStore>, engine: E) -> Self {
        Self {
            store,
            engine,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    // ── Listeners ───────────────────────────────────────────────────────────

    pub fn add_listener(&self, listener: Arc<dyn KeyManagerListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn KeyManagerListener>) {
        self.listeners.lock().retain(|l| !same_listener(l, listener));
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn KeyManagerListener>> {
        self.listeners.lock().clone()
    }

    fn notify(&self, change: &VerificationChange) {
        for listener in self.listeners_snapshot() {
            listener.verification_status_changed(change);
        }
    }

    pub fn remote_verified_us(&self, session: &SessionId) {
        for listener in self.listeners_snapshot() {
            listener.remote_verified_us(session);
        }
    }

    // ── Local identity ──────────────────────────────────────────────────────

    /// Replaces any existing key pair for `account_id`. Returns the new
    /// fingerprint, or `None` when the key algorithm is unavailable, in which
    /// case nothing is written.
    pub fn generate_local_key_pair(&self, account_id: &str) -> Result<Option<Fingerprint>> {
        info!("generating local key pair for {account_id}");
        let pair = match self.engine.generate_key_pair() {
            Ok(pair) => pair,
            Err(KeyStoreError::AlgorithmUnavailable(reason)) => {
                warn!("cannot generate key pair for {account_id}: {reason}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let private = self.engine.encode_private(&pair)?;
        let public = self.engine.public_key(&pair);
        let encoded_public = self.engine.encode_public(&public)?;
        let fingerprint = self.engine.fingerprint(&public)?;
        self.store.transaction(|tx| {
            tx.set_bytes(&schema::private_key(account_id), &private);
            tx.set_bytes(&schema::public_key(account_id), &encoded_public);
            tx.set_hex_bytes(&schema::fingerprint(account_id), fingerprint.as_bytes());
            Ok(())
        })?;
        info!("generated local key pair for {account_id}: {fingerprint}");
        Ok(Some(fingerprint))
    }

    /// Re-derives and re-stores the public key (and fingerprint) from the
    /// stored private key. Returns `false` when there is no usable private key.
    pub fn regenerate_local_public_key(&self, account_id: &str) -> Result<bool> {
        let Some(private) = self.read_bytes(&schema::private_key(account_id)) else {
            return Ok(false);
        };
        let pair = match self.engine.key_pair_from_private(&private) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("stored private key for {account_id} unusable: {e}");
                return Ok(false);
            }
        };
        let public = self.engine.public_key(&pair);
        let encoded_public = self.engine.encode_public(&public)?;
        let fingerprint = self.engine.fingerprint(&public)?;
        self.store.transaction(|tx| {
            tx.set_bytes(&schema::public_key(account_id), &encoded_public);
            tx.set_hex_bytes(&schema::fingerprint(account_id), fingerprint.as_bytes());
            Ok(())
        })?;
        Ok(true)
    }

    /// Missing or malformed key material yields `None`, never an error.
    pub fn load_local_key_pair(&self, account_id: &str) -> Option<E::KeyPair> {
        let private = self.read_bytes(&schema::private_key(account_id))?;
        let public = self.read_bytes(&schema::public_key(account_id))?;
        match self.engine.decode_key_pair(&private, &public) {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!("stored key pair for {account_id} unusable: {e}");
                None
            }
        }
    }

    /// Always recomputed from the stored key pair.
    pub fn local_fingerprint(&self, account_id: &str) -> Option<Fingerprint> {
        let pair = self.load_local_key_pair(account_id)?;
        match self.engine.fingerprint(&self.engine.public_key(&pair)) {
            Ok(fingerprint) => {
                debug!("local fingerprint for {account_id}: {fingerprint}");
                Some(fingerprint)
            }
            Err(e) => {
                warn!("cannot fingerprint local key for {account_id}: {e}");
                None
            }
        }
    }

    // ── Remote keys ─────────────────────────────────────────────────────────

    pub fn load_remote_public_key(&self, user_id: &str) -> Option<E::PublicKey> {
        if !has_resource(user_id) {
            return None;
        }
        let encoded = self.read_bytes(&schema::public_key(user_id))?;
        match self.engine.decode_public(&encoded) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("stored public key for {user_id} unusable: {e}");
                None
            }
        }
    }

    /// Cached fingerprint if present; otherwise computed from the stored
    /// public key and written back for next time.
    pub fn remote_fingerprint(&self, user_id: &str) -> Option<Fingerprint> {
        if !has_resource(user_id) {
            return None;
        }
        if let Ok(Some(bytes)) = self.store.get_hex_bytes(&schema::fingerprint(user_id)) {
            return Some(Fingerprint::from_bytes(bytes));
        }
        match self
            .store
            .transaction(|tx| Ok(self.resolve_fingerprint(tx, user_id)))
        {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!("cannot cache fingerprint for {user_id}: {e}");
                None
            }
        }
    }

    /// Cache lookup and fill against one locked view of the store.
    fn resolve_fingerprint(&self, tx: &mut Transaction<'_>, user_id: &str) -> Option<Fingerprint> {
        let key = schema::fingerprint(user_id);
        match tx.get_hex_bytes(&key) {
            Ok(Some(bytes)) => return Some(Fingerprint::from_bytes(bytes)),
            Ok(None) => {}
            Err(e) => warn!("cached fingerprint for {user_id} unreadable, recomputing: {e}"),
        }
        let encoded = match tx.get_bytes(&schema::public_key(user_id)) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return None,
            Err(e) => {
                warn!("value under {} is not valid base64: {e}", schema::public_key(user_id));
                return None;
            }
        };
        let fingerprint = match self
            .engine
            .decode_public(&encoded)
            .and_then(|public| self.engine.fingerprint(&public))
        {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                warn!("cannot fingerprint public key for {user_id}: {e}");
                return None;
            }
        };
        tx.set_hex_bytes(&key, fingerprint.as_bytes());
        Some(fingerprint)
    }

    /// Records a remote endpoint's key and fingerprint. The first sighting of
    /// a (user, fingerprint) pair seeds an unverified token; an existing
    /// decision is left alone. Bare ids are ignored.
    pub fn save_public_key(&self, user_id: &str, public: &E::PublicKey) -> Result<()> {
        if !has_resource(user_id) {
            debug!("ignoring public key for {user_id}: no resource");
            return Ok(());
        }
        let encoded = self.engine.encode_public(public)?;
        let fingerprint = self.engine.fingerprint(public)?;
        let token = schema::verified(user_id, &fingerprint.to_hex());
        self.store.transaction(|tx| {
            tx.set_bytes(&schema::public_key(user_id), &encoded);
            if !tx.contains(&token) {
                tx.set_bool(&token, false);
            }
            tx.set_hex_bytes(&schema::fingerprint(user_id), fingerprint.as_bytes());
            Ok(())
        })
    }

    // ── Verification ────────────────────────────────────────────────────────

    /// The session's `user_id` must be bare and its `full_user_id` must carry
    /// a resource; anything else is never verified.
    pub fn is_verified(&self, session: &SessionId) -> bool {
        if !session_is_well_formed(session) {
            return false;
        }
        self.remote_fingerprint(&session.full_user_id)
            .map(|fp| {
                self.store
                    .get_bool(&schema::verified(&session.user_id, &fp.to_hex()), false)
            })
            .unwrap_or(false)
    }

    /// Session-less check keyed by `user@host/resource`.
    pub fn is_verified_user(&self, full_user_id: &str) -> bool {
        self.remote_fingerprint(full_user_id)
            .map(|fp| {
                self.store
                    .get_bool(&schema::verified(strip_resource(full_user_id), &fp.to_hex()), false)
            })
            .unwrap_or(false)
    }

    /// Returns whether the token changed; listeners hear only about changes.
    pub fn verify(&self, session: &SessionId) -> Result<bool> {
        self.set_session_trust(session, true)
    }

    pub fn unverify(&self, session: &SessionId) -> Result<bool> {
        self.set_session_trust(session, false)
    }

    pub fn verify_user(&self, full_user_id: &str) -> Result<bool> {
        self.set_trust(full_user_id, strip_resource(full_user_id), None, true)
    }

    pub fn unverify_user(&self, full_user_id: &str) -> Result<bool> {
        self.set_trust(full_user_id, strip_resource(full_user_id), None, false)
    }

    fn set_session_trust(&self, session: &SessionId, verified: bool) -> Result<bool> {
        if !session_is_well_formed(session) {
            debug!("ignoring trust change for malformed session {session}");
            return Ok(false);
        }
        self.set_trust(&session.full_user_id, &session.user_id, Some(session), verified)
    }

    fn set_trust(
        &self,
        full_user_id: &str,
        bare_user_id: &str,
        session: Option<&SessionId>,
        verified: bool,
    ) -> Result<bool> {
        if !has_resource(full_user_id) {
            warn!("no known key for {full_user_id}, trust unchanged");
            return Ok(false);
        }
        // the fingerprint and the token it names are read and written under one lock
        let outcome = self.store.transaction(|tx| {
            let Some(fingerprint) = self.resolve_fingerprint(tx, full_user_id) else {
                return Ok(None);
            };
            let token = schema::verified(bare_user_id, &fingerprint.to_hex());
            if tx.get_bool(&token, false) == verified {
                return Ok(Some((fingerprint, false)));
            }
            tx.set_bool(&token, verified);
            Ok(Some((fingerprint, true)))
        })?;
        let Some((fingerprint, changed)) = outcome else {
            warn!("no known key for {full_user_id}, trust unchanged");
            return Ok(false);
        };
        if changed {
            info!(
                "{full_user_id} ({fingerprint}) is now {}",
                if verified { "verified" } else { "unverified" }
            );
            self.notify(&VerificationChange {
                full_user_id: full_user_id.to_string(),
                fingerprint,
                verified,
                session: session.cloned(),
            });
        }
        Ok(changed)
    }

    // ── Session-keyed conveniences ──────────────────────────────────────────

    pub fn generate_local_key_pair_for_session(
        &self,
        session: &SessionId,
    ) -> Result<Option<Fingerprint>> {
        self.generate_local_key_pair(&session.account_id)
    }

    pub fn load_local_key_pair_for_session(&self, session: &SessionId) -> Option<E::KeyPair> {
        self.load_local_key_pair(&session.account_id)
    }

    pub fn local_fingerprint_for_session(&self, session: &SessionId) -> Option<Fingerprint> {
        self.local_fingerprint(&session.account_id)
    }

    pub fn remote_fingerprint_for_session(&self, session: &SessionId) -> Option<Fingerprint> {
        self.remote_fingerprint(&session.full_user_id)
    }

    pub fn load_remote_public_key_for_session(&self, session: &SessionId) -> Option<E::PublicKey> {
        self.load_remote_public_key(&session.full_user_id)
    }

    pub fn save_public_key_for_session(
        &self,
        session: &SessionId,
        public: &E::PublicKey,
    ) -> Result<()> {
        self.save_public_key(&session.full_user_id, public)
    }

    fn read_bytes(&self, key: &str) -> Option<Vec<u8>> {
        match self.store.get_bytes(key) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("value under {key} is not valid base64: {e}");
                None
            }
        }
    }
}

fn session_is_well_formed(session: &SessionId) -> bool {
    !has_resource(&session.user_id) && has_resource(&session.full_user_id)
}

fn same_listener(a: &Arc<dyn KeyManagerListener>, b: &Arc<dyn KeyManagerListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
