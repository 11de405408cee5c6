use std::fmt::Display;

/// emberdb errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The requested key has no live value in the database.
    KeyNotFound,
    /// A key whose length falls outside the supported range (1..=65535 bytes).
    /// The on-disk record format cannot represent such keys.
    InvalidKey,
    /// The database at this path is not open (or was closed while the
    /// request was queued).
    NotOpen,
    /// The database files are already owned, either by another process or by
    /// a second handle that bypassed the registry.
    AlreadyOpen,
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::InvalidKey => write!(f, "key length out of range (1..=65535)"),
            Error::NotOpen => write!(f, "database not open"),
            Error::AlreadyOpen => write!(f, "database already open"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// An emberdb Result returning Error.
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
