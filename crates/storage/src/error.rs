use thiserror::Error;

/// Durability or serialization failure in the local cache. Always surfaced,
/// never swallowed.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cache lock poisoned")]
    Poisoned,

    #[error("core error: {0}")]
    Core(#[from] fieldsync_core::CoreError),
}

impl CacheError {
    /// Whether the device ran out of room, as opposed to a logic or encoding
    /// failure.
    pub fn is_storage_full(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::DiskFull
        )
    }
}
