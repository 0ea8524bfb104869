use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Store contents are not a property map: {0}")]
    Malformed(String),

    #[error("Stored key could not be decoded: {0}")]
    KeyDecode(String),

    #[error("Key algorithm unavailable: {0}")]
    AlgorithmUnavailable(String),

    #[error("Value encoding error: {0}")]
    Encoding(String),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<hex::FromHexError> for KeyStoreError {
    fn from(e: hex::FromHexError) -> Self {
        KeyStoreError::Encoding(format!("hex: {e}"))
    }
}

impl From<base64::DecodeError> for KeyStoreError {
    fn from(e: base64::DecodeError) -> Self {
        KeyStoreError::Encoding(format!("base64: {e}"))
    }
}

impl From<tempfile::PersistError> for KeyStoreError {
    fn from(e: tempfile::PersistError) -> Self {
        KeyStoreError::Io(e.error)
    }
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;
