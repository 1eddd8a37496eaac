//! Store error types.
//!
//! Precondition conflicts (a claim, completion, or reset that lost a
//! race) are deliberately not errors: the store signals them through
//! `false` / `None` return values so callers can count them and move
//! on. `StoreError` covers the cases that actually abort an operation.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
