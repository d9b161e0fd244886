//! Logging initialization.
//!
//! A single-purpose development proxy doesn't need the async-channel-backed
//! log sink larger services in this codebase use to avoid blocking request
//! handling on file I/O; `env_logger` writing straight to stderr is enough,
//! and keeps `RUST_LOG` working the way operators already expect.

pub fn init() {
    env_logger::init();
}
