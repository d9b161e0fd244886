//! Core logic of the replay-and-record HTTP/HTTPS proxy.
//!
//! Defines the modules for configuration, the cache store, the TLS CA,
//! the proxy engine, the admin HTTP surface, and the companion SSE broker.

pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod sse;
pub mod tls;

pub use error::{Error, Result};
