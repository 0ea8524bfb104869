//! The encrypted property store backing all identity and trust state.
//!
//! The whole map is re-serialized, re-encrypted and atomically replaced on
//! every committed mutation. Stores are small, so simplicity wins over write
//! amplification; batch related writes with [`KeyStore::transaction`].

use crate::codec::StoreFormat;
use crate::config::KeyStoreConfig;
use crate::error::{KeyStoreError, Result};
use crate::migration;
use crate::properties::{self, PropertyMap};
use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zeroize::Zeroizing;

pub struct KeyStore {
    path: PathBuf,
    password: Zeroizing<String>,
    state: Mutex<StoreState>,
}

struct StoreState {
    props: PropertyMap,
    // digest of the file bytes last read or written by this handle
    digest: Option<blake3::Hash>,
}

/// A mutable view of the map under the store lock. Changes are persisted
/// once when the transaction closure returns `Ok`.
pub struct Transaction<'a> {
    props: &'a mut PropertyMap,
    dirty: bool,
}

impl KeyStore {
    /// Opens (or starts) the store described by `config` and brings its
    /// schema up to date before handing it out.
    pub fn open(config: &KeyStoreConfig) -> Result<Self> {
        let store = Self::open_path(&config.store_path, &config.password)?;
        migration::upgrade(&store, config.legacy_path.as_deref())?;
        Ok(store)
    }

    pub(crate) fn open_path(path: &Path, password: &str) -> Result<Self> {
        let (props, digest) = match read_file(path, password, StoreFormat::Container)? {
            Some((props, digest)) => (props, Some(digest)),
            None => {
                debug!("no key store at {}, starting empty", path.display());
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                (PropertyMap::new(), None)
            }
        };
        info!("opened key store {} ({} entries)", path.display(), props.len());
        Ok(Self {
            path: path.to_path_buf(),
            password: Zeroizing::new(password.to_string()),
            state: Mutex::new(StoreState { props, digest }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.state.lock().props.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        parse_bool(self.state.lock().props.get(key), default)
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        decode_base64(self.state.lock().props.get(key))
    }

    pub fn get_hex_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        decode_hex(self.state.lock().props.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().props.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().props.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> PropertyMap {
        self.state.lock().props.clone()
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.transaction(|tx| {
            tx.set_string(key, value);
            Ok(())
        })
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.transaction(|tx| {
            tx.set_bool(key, value);
            Ok(())
        })
    }

    pub fn set_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        self.transaction(|tx| {
            tx.set_bytes(key, value);
            Ok(())
        })
    }

    pub fn set_hex_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        self.transaction(|tx| {
            tx.set_hex_bytes(key, value);
            Ok(())
        })
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        self.transaction(|tx| Ok(tx.remove(key)))
    }

    /// Runs `f` with exclusive access to a working copy of the map. If `f`
    /// succeeds and changed anything, the copy is written out and becomes the
    /// live map; on any error the live map is left untouched.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        let mut working = state.props.clone();
        let mut tx = Transaction {
            props: &mut working,
            dirty: false,
        };
        let out = f(&mut tx)?;
        let dirty = tx.dirty;
        if dirty {
            let digest = write_store(&self.path, &working, &self.password, StoreFormat::Container)?;
            state.props = working;
            state.digest = Some(digest);
        }
        Ok(out)
    }

    /// Re-reads the backing file with the cached password. A file that is
    /// missing or unchanged since the last read or write is a no-op. On
    /// failure the in-memory map keeps its last good contents.
    pub fn reload(&self) -> Result<()> {
        let mut state = self.state.lock();
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(());
        }
        let digest = blake3::hash(&data);
        if state.digest == Some(digest) {
            debug!("key store unchanged on disk, skipping reload");
            return Ok(());
        }
        let props = decode_store(&data, &self.password, StoreFormat::Container)?;
        info!("reloaded key store from disk ({} entries)", props.len());
        state.props = props;
        state.digest = Some(digest);
        Ok(())
    }

    /// Writes the full current map to `path` under `password`. The live
    /// store's file and password are not touched.
    pub fn export(&self, password: &str, path: &Path) -> Result<()> {
        self.export_as(password, path, StoreFormat::Container)
    }

    pub(crate) fn export_as(&self, password: &str, path: &Path, format: StoreFormat) -> Result<()> {
        let state = self.state.lock();
        write_store(path, &state.props, password, format)?;
        info!("exported key store to {} as {format:?}", path.display());
        Ok(())
    }
}

impl<'a> Transaction<'a> {
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        parse_bool(self.props.get(key), default)
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        decode_base64(self.props.get(key))
    }

    pub fn get_hex_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        decode_hex(self.props.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.props.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.props.keys().cloned().collect()
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        if self.props.get(key).map(String::as_str) != Some(value) {
            self.props.insert(key.to_string(), value.to_string());
            self.dirty = true;
        }
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set_string(key, if value { "true" } else { "false" });
    }

    pub fn set_bytes(&mut self, key: &str, value: &[u8]) {
        self.set_string(key, &general_purpose::STANDARD.encode(value));
    }

    pub fn set_hex_bytes(&mut self, key: &str, value: &[u8]) {
        self.set_string(key, &hex::encode(value));
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let removed = self.props.remove(key).is_some();
        self.dirty |= removed;
        removed
    }
}

/// Reads and decrypts a store file. `None` means there is nothing to read.
pub(crate) fn read_file(
    path: &Path,
    password: &str,
    format: StoreFormat,
) -> Result<Option<(PropertyMap, blake3::Hash)>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() {
        return Ok(None);
    }
    let props = decode_store(&data, password, format)?;
    Ok(Some((props, blake3::hash(&data))))
}

fn decode_store(data: &[u8], password: &str, format: StoreFormat) -> Result<PropertyMap> {
    let plaintext = format.decrypt(data, password)?;
    properties::parse(&plaintext).map_err(|e| match e {
        KeyStoreError::Malformed(reason) => {
            KeyStoreError::Decryption(format!("wrong password or corrupt store ({reason})"))
        }
        other => other,
    })
}

fn write_store(
    path: &Path,
    props: &PropertyMap,
    password: &str,
    format: StoreFormat,
) -> Result<blake3::Hash> {
    let plaintext = Zeroizing::new(properties::serialize(props));
    let data = format.encrypt(plaintext.as_bytes(), password)?;
    write_atomic(path, &data)?;
    debug!("wrote key store {} ({} entries)", path.display(), props.len());
    Ok(blake3::hash(&data))
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let mut tmp = NamedTempFile::new_in(&parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

fn parse_bool(value: Option<&String>, default: bool) -> bool {
    match value {
        Some(v) => v.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

// Other writers wrap base64 at 76 columns.
fn decode_base64(value: Option<&String>) -> Result<Option<Vec<u8>>> {
    value
        .map(|v| {
            let compact: String = v.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            general_purpose::STANDARD.decode(compact)
        })
        .transpose()
        .map_err(Into::into)
}

fn decode_hex(value: Option<&String>) -> Result<Option<Vec<u8>>> {
    value.map(|v| hex::decode(v.trim())).transpose().map_err(Into::into)
}
