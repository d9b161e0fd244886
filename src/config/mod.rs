//! Configuration and runtime-mutable proxy mode.
//!
//! Unlike a multi-source config loader backed by a file format and a remote
//! watch, this crate's configuration is deliberately small: every field has
//! a default, every source is an environment variable, and the only
//! runtime-mutable piece is [`Mode`], held behind an [`ArcSwap`] so reads on
//! the request path never block.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

const DEFAULT_PORT: u16 = 8055;
const DEFAULT_FIXTURES_DIR: &str = "/app/fixtures";
const DEFAULT_CACHE_DIR: &str = "/app/cache";
const DEFAULT_CERTS_DIR: &str = "/app/certs";
const DEFAULT_LIVE_TIMEOUT_SECS: u64 = 30;

/// Proxy behavior for a given request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Replay,
    Record,
    Live,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Replay
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Replay => "replay",
            Mode::Record => "record",
            Mode::Live => "live",
        };
        f.write_str(s)
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replay" => Ok(Mode::Replay),
            "record" => Ok(Mode::Record),
            "live" => Ok(Mode::Live),
            _ => Err(()),
        }
    }
}

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub fixtures_dir: String,
    pub cache_dir: String,
    pub certs_dir: String,
    pub live_timeout: Duration,
}

impl Config {
    /// Reads environment variables, applying defaults for anything unset or
    /// unparsable. No configuration is required to start the proxy.
    pub fn load() -> Self {
        let port = env::var("PROXY_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let fixtures_dir =
            env::var("PROXY_FIXTURES_DIR").unwrap_or_else(|_| DEFAULT_FIXTURES_DIR.to_string());
        let cache_dir =
            env::var("PROXY_CACHE_DIR").unwrap_or_else(|_| DEFAULT_CACHE_DIR.to_string());
        let certs_dir =
            env::var("PROXY_CERTS_DIR").unwrap_or_else(|_| DEFAULT_CERTS_DIR.to_string());

        let live_timeout = env::var("PROXY_LIVE_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_LIVE_TIMEOUT_SECS));

        let config = Config {
            port,
            fixtures_dir,
            cache_dir,
            certs_dir,
            live_timeout,
        };

        // PROXY_MODE seeds the initial runtime mode; invalid values fall
        // back to the default silently (compat with existing deployments).
        if let Ok(raw) = env::var("PROXY_MODE") {
            match raw.parse::<Mode>() {
                Ok(mode) => set_mode(mode),
                Err(()) => log::warn!("ignoring invalid PROXY_MODE={raw:?}, using default"),
            }
        }

        config
    }
}

static MODE: Lazy<ArcSwap<Mode>> = Lazy::new(|| ArcSwap::new(Arc::new(Mode::default())));

/// Returns the current mode. Non-blocking; in-flight requests should call
/// this once at entry and use the captured value for the rest of their
/// lifetime so a concurrent `set_mode` never retroactively changes them.
pub fn mode() -> Mode {
    **MODE.load()
}

/// Atomically replaces the current mode. Publishes happen-before ordering
/// to any subsequent call to [`mode`].
pub fn set_mode(mode: Mode) {
    MODE.store(Arc::new(mode));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_display_and_parse() {
        for m in [Mode::Replay, Mode::Record, Mode::Live] {
            let parsed: Mode = m.to_string().parse().unwrap();
            assert_eq!(parsed, m);
        }
    }

    #[test]
    fn mode_parse_rejects_unknown_strings() {
        assert!("bogus".parse::<Mode>().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config {
            port: DEFAULT_PORT,
            fixtures_dir: DEFAULT_FIXTURES_DIR.to_string(),
            cache_dir: DEFAULT_CACHE_DIR.to_string(),
            certs_dir: DEFAULT_CERTS_DIR.to_string(),
            live_timeout: Duration::from_secs(DEFAULT_LIVE_TIMEOUT_SECS),
        };
        assert_eq!(config.port, 8055);
        assert_eq!(config.live_timeout, Duration::from_secs(30));
    }
}
