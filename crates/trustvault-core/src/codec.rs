//! Password-based encryption of whole store files.
//!
//! The primary format is the OpenSSL `enc` container: the ASCII magic
//! `Salted__`, an 8 byte salt, then AES-256-CBC ciphertext. Key and IV come
//! from `EVP_BytesToKey` (MD5, one round), so `openssl enc -d -aes-256-cbc -md md5`
//! can open a store and vice versa.
//!
//! The legacy transfer format (`.ofcaes`) has no header beyond a random IV and
//! keys AES directly with SHA-256 of the password. It is only ever read through
//! an explicit import.

use crate::error::{KeyStoreError, Result};
use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const CONTAINER_MAGIC: &[u8] = b"Salted__";
pub const SALT_LEN: usize = 8;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const KDF_ITERATIONS: usize = 1;
pub const LEGACY_EXTENSION: &str = "ofcaes";
const BLOCK_LEN: usize = 16;

/// On-disk encryption layout of a store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    Container,
    Legacy,
}

impl StoreFormat {
    /// `.ofcaes` files are legacy transfers, everything else is a container.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case(LEGACY_EXTENSION) => StoreFormat::Legacy,
            _ => StoreFormat::Container,
        }
    }

    pub fn encrypt(self, plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
        match self {
            StoreFormat::Container => encrypt(plaintext, password),
            StoreFormat::Legacy => encrypt_legacy(plaintext, password),
        }
    }

    pub fn decrypt(self, data: &[u8], password: &str) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            StoreFormat::Container => decrypt(data, password),
            StoreFormat::Legacy => decrypt_legacy(data, password),
        }
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5.
pub fn derive_key_iv(password: &str, salt: &[u8]) -> (Zeroizing<[u8; KEY_LEN]>, [u8; IV_LEN]) {
    let mut material = Zeroizing::new(Vec::with_capacity(KEY_LEN + IV_LEN + 16));
    let mut prev = Zeroizing::new(Vec::new());
    while material.len() < KEY_LEN + IV_LEN {
        let mut hasher = Md5::new();
        hasher.update(&prev[..]);
        hasher.update(password.as_bytes());
        hasher.update(salt);
        let mut digest = hasher.finalize();
        for _ in 1..KDF_ITERATIONS {
            digest = Md5::digest(digest);
        }
        material.extend_from_slice(&digest);
        *prev = digest.to_vec();
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&material[..KEY_LEN]);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&material[KEY_LEN..KEY_LEN + IV_LEN]);
    (key, iv)
}

pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    encrypt_with_salt(plaintext, password, &generate_salt())
}

pub fn encrypt_with_salt(plaintext: &[u8], password: &str, salt: &[u8; SALT_LEN]) -> Result<Vec<u8>> {
    let (key, iv) = derive_key_iv(password, salt);
    let cipher = Aes256CbcEnc::new_from_slices(&key[..], &iv)
        .map_err(|e| KeyStoreError::AlgorithmUnavailable(format!("aes-256-cbc: {e}")))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mut out = Vec::with_capacity(CONTAINER_MAGIC.len() + SALT_LEN + ciphertext.len());
    out.extend_from_slice(CONTAINER_MAGIC);
    out.extend_from_slice(salt);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a container. A wrong password usually fails the padding check,
/// but not always; callers must validate the plaintext.
pub fn decrypt(data: &[u8], password: &str) -> Result<Zeroizing<Vec<u8>>> {
    let header_len = CONTAINER_MAGIC.len() + SALT_LEN;
    if data.len() < header_len + BLOCK_LEN {
        return Err(KeyStoreError::Decryption("container too short".into()));
    }
    if &data[..CONTAINER_MAGIC.len()] != CONTAINER_MAGIC {
        return Err(KeyStoreError::Decryption("missing container magic".into()));
    }
    let salt = &data[CONTAINER_MAGIC.len()..header_len];
    let body = &data[header_len..];
    if body.len() % BLOCK_LEN != 0 {
        return Err(KeyStoreError::Decryption("ciphertext not block aligned".into()));
    }
    let (key, iv) = derive_key_iv(password, salt);
    cbc_decrypt(&key[..], &iv, body)
}

fn legacy_key(password: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&Sha256::digest(password.as_bytes()));
    key
}

pub fn encrypt_legacy(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let key = legacy_key(password);
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let cipher = Aes256CbcEnc::new_from_slices(&key[..], &iv)
        .map_err(|e| KeyStoreError::AlgorithmUnavailable(format!("aes-256-cbc: {e}")))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_legacy(data: &[u8], password: &str) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() < IV_LEN + BLOCK_LEN || (data.len() - IV_LEN) % BLOCK_LEN != 0 {
        return Err(KeyStoreError::Decryption("legacy ciphertext length invalid".into()));
    }
    let (iv, body) = data.split_at(IV_LEN);
    cbc_decrypt(&legacy_key(password)[..], iv, body)
}

fn cbc_decrypt(key: &[u8], iv: &[u8], body: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| KeyStoreError::AlgorithmUnavailable(format!("aes-256-cbc: {e}")))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| KeyStoreError::Decryption("bad padding, wrong password?".into()))?;
    Ok(Zeroizing::new(plaintext))
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}
