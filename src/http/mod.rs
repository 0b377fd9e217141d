//! HTTP surface: the axum router with the caching proxy handler, and the
//! upstream protocol helpers it drives.

pub mod handler;
pub mod upstream;
