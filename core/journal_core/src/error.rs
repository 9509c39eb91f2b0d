use crate::{model::ShiftKind, shift::ShiftState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt log: {0}")]
    Corrupt(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Errors that mean "the bytes on disk are not a journal", as opposed to
    /// an environment failure such as a full disk.
    pub fn is_corrupt(&self) -> bool {
        match self {
            StoreError::Corrupt(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt
            ),
            StoreError::Sqlite(rusqlite::Error::FromSqlConversionFailure(..))
            | StoreError::Sqlite(rusqlite::Error::InvalidColumnType(..)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("illegal shift transition {kind} while {state}: {reason}")]
    IllegalTransition {
        kind: ShiftKind,
        state: ShiftState,
        reason: &'static str,
    },
    #[error("note is empty")]
    EmptyNote,
    #[error("unknown category '{0}'")]
    UnknownCategory(String),
}
