//! Error types for the zonestor core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the zone management core
#[derive(Error, Debug)]
pub enum Error {
    /// Caller handed us something we cannot work with (bad device path,
    /// unaligned append size, unknown file id)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device exists but cannot back this core (wrong model, too few zones)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An append was larger than the remaining capacity of its target zone
    #[error("no space: {0}")]
    NoSpace(String),

    /// Underlying device I/O failure (report, reset, finish, close, read, write)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for wrapping a device-level failure that has no richer
    /// `std::io::Error` behind it.
    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(std::io::Error::other(msg.into()))
    }
}
