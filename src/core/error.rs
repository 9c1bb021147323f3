use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the coordination layer.
///
/// Everything except [`Error::PayloadTooLarge`] and [`Error::InvalidConfig`]
/// means the shared store cannot be used; see [`Error::is_store_unavailable`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot open store at {path}: {source}")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store: {0}")]
    Corrupt(&'static str),
    #[error("unsupported store version: {0}")]
    UnsupportedVersion(u32),
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// True when the store could not be opened, locked or decoded. The
    /// caller cannot learn its singleton status and has to fall back.
    pub fn is_store_unavailable(&self) -> bool {
        !matches!(self, Error::PayloadTooLarge { .. } | Error::InvalidConfig(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_store_errors() {
        assert!(Error::Corrupt("bad magic").is_store_unavailable());
        assert!(Error::UnsupportedVersion(9).is_store_unavailable());
        assert!(Error::from(std::io::Error::other("boom")).is_store_unavailable());
        assert!(!Error::PayloadTooLarge { len: 600, max: 512 }.is_store_unavailable());
        assert!(!Error::InvalidConfig("x".into()).is_store_unavailable());
    }
}
