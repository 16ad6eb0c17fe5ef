use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row violates an invariant the caller relies on (e.g. writing
    /// to a concluded experiment).  Policy errors; the caller logs and skips.
    #[error("policy violation: {0}")]
    Policy(String),

    #[error("store closed: {0}")]
    Closed(String),
}
