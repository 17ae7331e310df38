//! Database error classification.
//!
//! Wraps [`sqlx::Error`] into a small set of cases the rest of the
//! application can match on without inspecting Postgres error codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("row not found")]
    NotFound,

    #[error("unique constraint violation ({})", constraint.as_deref().unwrap_or("unknown"))]
    UniqueViolation {
        constraint: Option<String>,
        table: Option<String>,
    },

    #[error("foreign key violation ({})", constraint.as_deref().unwrap_or("unknown"))]
    ForeignKeyViolation { constraint: Option<String> },

    #[error("database connection pool exhausted")]
    PoolExhausted,

    #[error(transparent)]
    Other(sqlx::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::Database(db) => {
                let constraint = db.constraint().map(str::to_string);
                let table = db.table().map(str::to_string);
                match db.code().as_deref() {
                    // unique_violation
                    Some("23505") => DbError::UniqueViolation { constraint, table },
                    // foreign_key_violation
                    Some("23503") => DbError::ForeignKeyViolation { constraint },
                    _ => DbError::Other(err),
                }
            }
            _ => DbError::Other(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
