use std::io;
use std::path::PathBuf;

/// Errors surfaced by pool construction and by the append log's file
/// operations. Misuse of the hot-path primitives (re-entrant `map`,
/// reserving past the ensured capacity) is not reported here: those are
/// programming errors and panic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// Creating, resizing, mapping or syncing the log file failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Bytes were reserved past the mapped capacity, so the file cannot hold
    /// everything that was handed out.
    #[error("{} overflowed: {used} bytes reserved with capacity {capacity}", .path.display())]
    Overflow {
        path: PathBuf,
        used: usize,
        capacity: usize,
    },

    /// The map log could not be serialized.
    #[error("map log encoding failed: {0}")]
    Encode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
