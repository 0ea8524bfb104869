//! The public-key primitives the key manager drives.
//!
//! Key material is persisted in portable encodings: PKCS#8 DER for private
//! keys, X.509 SubjectPublicKeyInfo DER for public keys. Fingerprints follow
//! the OTR definition, SHA-1 over the public key's MPI serialization.

use crate::error::{KeyStoreError, Result};
use dsa::{Components, KeySize, SigningKey, VerifyingKey};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use sha1::{Digest, Sha1};
use std::fmt;
use zeroize::Zeroizing;

/// Digest of a public key, compared by humans when verifying an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Self(hex::decode(s.trim())?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex, the form stored and used in verification token keys.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Upper-case hex in groups of eight, for reading aloud.
    pub fn to_human(&self) -> String {
        self.to_hex()
            .to_ascii_uppercase()
            .as_bytes()
            .chunks(8)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub trait CryptoEngine: Send + Sync {
    type KeyPair: Send;
    type PublicKey: Send;

    fn generate_key_pair(&self) -> Result<Self::KeyPair>;

    fn public_key(&self, pair: &Self::KeyPair) -> Self::PublicKey;

    /// Rebuilds a key pair from its private half alone.
    fn key_pair_from_private(&self, private: &[u8]) -> Result<Self::KeyPair>;

    fn encode_private(&self, pair: &Self::KeyPair) -> Result<Zeroizing<Vec<u8>>>;

    fn encode_public(&self, key: &Self::PublicKey) -> Result<Vec<u8>>;

    fn decode_key_pair(&self, private: &[u8], public: &[u8]) -> Result<Self::KeyPair>;

    fn decode_public(&self, public: &[u8]) -> Result<Self::PublicKey>;

    fn fingerprint(&self, key: &Self::PublicKey) -> Result<Fingerprint>;
}

pub struct DsaKeyPair {
    pub signing: SigningKey,
    pub verifying: VerifyingKey,
}

/// 1024/160-bit DSA, the OTR long-term identity key.
#[derive(Default)]
pub struct DsaEngine {
    components: Option<Components>,
}

impl DsaEngine {
    /// Fresh domain parameters are generated for every key pair.
    pub fn new() -> Self {
        Self { components: None }
    }

    /// Reuses one set of domain parameters for every key pair.
    pub fn with_components(components: Components) -> Self {
        Self {
            components: Some(components),
        }
    }

    #[allow(deprecated)]
    pub fn generate_components() -> Components {
        Components::generate(&mut rand::rngs::OsRng, KeySize::DSA_1024_160)
    }
}

impl CryptoEngine for DsaEngine {
    type KeyPair = DsaKeyPair;
    type PublicKey = VerifyingKey;

    fn generate_key_pair(&self) -> Result<DsaKeyPair> {
        let components = match &self.components {
            Some(c) => c.clone(),
            None => Self::generate_components(),
        };
        let signing = SigningKey::generate(&mut rand::rngs::OsRng, components);
        let verifying = signing.verifying_key().clone();
        Ok(DsaKeyPair { signing, verifying })
    }

    fn public_key(&self, pair: &DsaKeyPair) -> VerifyingKey {
        pair.verifying.clone()
    }

    fn key_pair_from_private(&self, private: &[u8]) -> Result<DsaKeyPair> {
        let signing = SigningKey::from_pkcs8_der(private)
            .map_err(|e| KeyStoreError::KeyDecode(format!("private key: {e}")))?;
        let verifying = signing.verifying_key().clone();
        Ok(DsaKeyPair { signing, verifying })
    }

    fn encode_private(&self, pair: &DsaKeyPair) -> Result<Zeroizing<Vec<u8>>> {
        let doc = pair
            .signing
            .to_pkcs8_der()
            .map_err(|e| KeyStoreError::Encoding(format!("pkcs8: {e}")))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    fn encode_public(&self, key: &VerifyingKey) -> Result<Vec<u8>> {
        let doc = key
            .to_public_key_der()
            .map_err(|e| KeyStoreError::Encoding(format!("spki: {e}")))?;
        Ok(doc.as_bytes().to_vec())
    }

    fn decode_key_pair(&self, private: &[u8], public: &[u8]) -> Result<DsaKeyPair> {
        let signing = SigningKey::from_pkcs8_der(private)
            .map_err(|e| KeyStoreError::KeyDecode(format!("private key: {e}")))?;
        let verifying = self.decode_public(public)?;
        Ok(DsaKeyPair { signing, verifying })
    }

    fn decode_public(&self, public: &[u8]) -> Result<VerifyingKey> {
        VerifyingKey::from_public_key_der(public)
            .map_err(|e| KeyStoreError::KeyDecode(format!("public key: {e}")))
    }

    fn fingerprint(&self, key: &VerifyingKey) -> Result<Fingerprint> {
        let components = key.components();
        let mut hasher = Sha1::new();
        for mpi in [components.p(), components.q(), components.g(), key.y()] {
            let bytes = mpi.to_bytes_be();
            let len = u32::try_from(bytes.len())
                .map_err(|_| KeyStoreError::Encoding("mpi too large".into()))?;
            hasher.update(len.to_be_bytes());
            hasher.update(&bytes);
        }
        Ok(Fingerprint::from_bytes(hasher.finalize().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_renderings() {
        let fp = Fingerprint::from_hex("0a1b2c3d4e5f60718293a4b5c6d7e8f901234567").unwrap();
        assert_eq!(fp.to_string(), "0a1b2c3d4e5f60718293a4b5c6d7e8f901234567");
        assert_eq!(fp.to_human(), "0A1B2C3D 4E5F6071 8293A4B5 C6D7E8F9 01234567");
        assert!(Fingerprint::from_hex("zz").is_err());
    }

    #[test]
    fn dsa_encodings_roundtrip_and_fingerprint_is_stable() {
        let engine = DsaEngine::with_components(DsaEngine::generate_components());
        let pair = engine.generate_key_pair().unwrap();
        let private = engine.encode_private(&pair).unwrap();
        let public = engine.encode_public(&pair.verifying).unwrap();

        let decoded = engine.decode_key_pair(&private, &public).unwrap();
        assert_eq!(engine.encode_public(&decoded.verifying).unwrap(), public);

        let rebuilt = engine.key_pair_from_private(&private).unwrap();
        assert_eq!(engine.encode_public(&rebuilt.verifying).unwrap(), public);

        let fp = engine.fingerprint(&pair.verifying).unwrap();
        assert_eq!(fp.as_bytes().len(), 20);
        assert_eq!(fp, engine.fingerprint(&decoded.verifying).unwrap());

        let other = engine.generate_key_pair().unwrap();
        assert_ne!(fp, engine.fingerprint(&other.verifying).unwrap());
    }

    #[test]
    fn garbage_keys_fail_to_decode() {
        let engine = DsaEngine::new();
        assert!(matches!(
            engine.decode_public(b"not der"),
            Err(KeyStoreError::KeyDecode(_))
        ));
        assert!(matches!(
            engine.key_pair_from_private(&[0x30, 0x03, 0x02, 0x01, 0x00]),
            Err(KeyStoreError::KeyDecode(_))
        ));
    }
}
