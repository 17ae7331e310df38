//! HTTP surface: request/response models and axum handlers. The router is
//! assembled in the crate root.

pub mod handlers;
pub mod models;
