use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BurrowError>;

#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("page not found")]
    PageNotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("key not found")]
    KeyNotFound,
    #[error("database is read-only")]
    DatabaseReadOnly,
    #[error("database is not open")]
    DatabaseNotOpen,
    #[error("transaction is read-only")]
    TransactionReadOnly,
}
