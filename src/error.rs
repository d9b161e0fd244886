//! Crate-wide error taxonomy.
//!
//! Each proxy-facing operation returns `Result<T, Error>`; the HTTP layer
//! (proxy engine, admin surface) maps variants onto wire responses at the
//! boundary. Core logic never encodes a status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("upstream transport error fetching {url}: {source}")]
    UpstreamTransport {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("invalid mode: {0}")]
    InvalidMode(String),
}

pub type Result<T> = std::result::Result<T, Error>;
