//! Error taxonomy for the statfile engine.
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file too small: {size} bytes, need at least {minimum}")]
    FileTooSmall { size: u64, minimum: u64 },

    #[error("bad magic in {}", path.display())]
    BadMagic { path: PathBuf },

    #[error("bad version {0:?}")]
    BadVersion([u8; 2]),

    #[error("file truncated: {actual} bytes, section needs {expected}")]
    Truncated { actual: u64, expected: u64 },

    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("statfile pool at capacity ({max})")]
    CapacityExceeded { max: usize },

    #[error("section {code} not found")]
    SectionNotFound { code: u64 },

    #[error("reindex of {} failed: {reason}", path.display())]
    ReindexFailed { path: PathBuf, reason: String },

    #[error("no open handle with id {id}")]
    HandleNotFound { id: usize },

    #[error("no statfile configured for symbol {symbol:?}")]
    SymbolNotConfigured { symbol: String },
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { op, path: path.into(), source }
    }
}
