//! Error types shared across the proxy group manager.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PgmError>;

#[derive(Debug, Error)]
pub enum PgmError {
    #[error("config error: {0}")]
    Config(String),

    /// The database reported it is unavailable; the caller retries the
    /// whole transaction body.
    #[error("database is down")]
    DbUnavailable,

    #[error("database error: {0}")]
    Db(sqlx::Error),

    /// A lookup that must always succeed failed. The offending row is
    /// skipped so one bad row cannot halt the update loop.
    #[error("cache inconsistency: {0}")]
    CacheInconsistent(String),

    #[error("cannot start IPC service: {0}")]
    IpcInit(#[source] io::Error),

    #[error("ipc protocol error: {0}")]
    IpcProtocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PgmError {
    /// Transient database unavailability, recovered by retrying the
    /// transaction; everything else is surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, PgmError::DbUnavailable)
    }
}

impl From<sqlx::Error> for PgmError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                PgmError::DbUnavailable
            }
            other => PgmError::Db(other),
        }
    }
}
