//! Error types for map persistence.

/// Errors surfaced by the map codec and the save/load entry points.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Underlying I/O failure (open, read, write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream decoded to something structurally impossible.
    #[error("corrupt map file: {0}")]
    Corrupt(String),

    /// A matrix payload declared an element type we do not know.
    #[error("unsupported matrix element type tag: {0}")]
    UnknownElemType(u64),
}
