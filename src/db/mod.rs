//! Persistence layer: repositories over PostgreSQL.
//!
//! Each aggregate has a repository in [`handlers`] that borrows a
//! `PgConnection`, so callers decide the transaction boundary. Row structs
//! live in [`models`].

pub mod errors;
pub mod handlers;
pub mod models;
