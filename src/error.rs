use std::path::PathBuf;
use std::time::Duration;

/// The note source could not be read. Aborts the cycle.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("note source not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read note source: {0}")]
    Read(String),

    #[error("note source did not answer within {0:?}")]
    Timeout(Duration),
}

impl From<rusqlite::Error> for FetchError {
    fn from(e: rusqlite::Error) -> Self {
        FetchError::Read(e.to_string())
    }
}

/// A single embedding call failed. Never fatal for a cycle.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding model failed: {0}")]
    Model(String),

    #[error("embedding timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding worker panicked: {0}")]
    Worker(String),
}

/// Vector store failure. Per-note on writes, fatal when the store cannot be opened.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("corrupt embedding blob for note {0}")]
    CorruptEmbedding(String),
}

/// Rejections and failures of the indexing coordinator.
#[derive(Debug, thiserror::Error)]
pub enum IndexingError {
    #[error("an indexing cycle is already running")]
    AlreadyIndexing,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("indexing cancelled")]
    Cancelled,
}

/// Search-time failures, answered directly to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search query is empty")]
    EmptyQuery,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Malformed inbound message. The session stays open.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidJson(_) => "invalid_json",
            ProtocolError::UnsupportedType(_) => "unsupported_type",
            ProtocolError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

impl SearchError {
    pub fn code(&self) -> &'static str {
        match self {
            SearchError::EmptyQuery => "empty_query",
            SearchError::Embedding(_) => "embedding_failed",
            SearchError::Storage(_) => "storage_failed",
        }
    }
}
