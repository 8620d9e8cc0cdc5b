//! Transport layer for usher.
//!
//! Currently provides HTTP transport via axum. The handlers are a thin
//! translation layer: every route is one coordinator call plus an
//! error-to-status mapping.

pub mod http;

pub use http::{ServerConfig, serve};
