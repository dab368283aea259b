use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// kilndb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// An empty key was passed to a write operation.
    KeyEmpty,
    /// The key exceeds the configured maximum key length.
    KeyTooLarge,
    /// The value exceeds the configured maximum value length.
    ValueTooLarge,
    /// The store holds the configured maximum number of keys.
    Full,
    /// A batch was initialized while already bound to a memdb.
    BatchInProgress,
    /// An internal key blob was too short to parse.
    InvalidInternalKey,
    /// The entry's expiry time has passed. Readers skip these silently.
    KeyExpired,
    /// A file carried an unknown magic number.
    InvalidMagic,
    /// A file carried a format version this build does not understand.
    UnsupportedVersion(u32),
    /// A file header was truncated or malformed.
    InvalidHeader,
    /// Invalid data, typically decoding errors or on-disk corruption.
    Corrupted(String),
    /// The database directory is locked by another process.
    Locked(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::KeyEmpty => write!(f, "key is empty"),
            Error::KeyTooLarge => write!(f, "key is too large"),
            Error::ValueTooLarge => write!(f, "value is too large"),
            Error::Full => write!(f, "database is full"),
            Error::BatchInProgress => write!(f, "batch is already in progress"),
            Error::InvalidInternalKey => write!(f, "invalid internal key"),
            Error::KeyExpired => write!(f, "key has expired"),
            Error::InvalidMagic => write!(f, "invalid file magic"),
            Error::UnsupportedVersion(v) => write!(f, "unsupported format version {v}"),
            Error::InvalidHeader => write!(f, "invalid file header"),
            Error::Corrupted(msg) => write!(f, "corrupted data: {msg}"),
            Error::Locked(msg) => write!(f, "database is locked: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// A kilndb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corrupted(err.to_string())
    }
}
