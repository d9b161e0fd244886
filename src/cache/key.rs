//! Cache key generation: a pure function of `(method, url, User-Agent,
//! Accept-Language)`. Built on `sha2` and `url` (whose own query-pair
//! encoder handles percent-encoding) rather than a hand-rolled URL parser.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use url::Url;

const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "ref",
];

/// Normalizes a URL per the documented rules: lowercase host, drop known
/// tracking params, sort the remainder by key (stable on value order),
/// re-encode. Falls back to the raw string verbatim if parsing fails.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    if let Some(host) = url.host_str() {
        let lower = host.to_ascii_lowercase();
        if lower != host {
            let _ = url.set_host(Some(&lower));
        }
    }

    let mut kept: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in url.query_pairs() {
        if TRACKING_PARAMS.contains(&k.as_ref()) {
            continue;
        }
        kept.entry(k.into_owned()).or_default().push(v.into_owned());
    }

    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, values) in &kept {
            for v in values {
                pairs.append_pair(k, v);
            }
        }
        drop(pairs);
    }

    url.to_string()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generates the opaque `"{METHOD}_{hex12}"` cache key for a request.
pub fn generate_key(method: &str, url: &str, user_agent: &str, accept_language: &str) -> String {
    let normalized = normalize_url(url);
    let header_hash = sha256_hex(&format!("{user_agent}\n{accept_language}"));
    let digest = sha256_hex(&format!("{normalized}\n{header_hash}"));
    format!("{}_{}", method.to_ascii_uppercase(), &digest[..12])
}

/// Maps a host to its cache directory name: lowercase, strip a leading
/// `www.`, replace `.` with `-`.
pub fn domain_dir_name(host: &str) -> String {
    let lower = host.to_ascii_lowercase();
    let stripped = lower.strip_prefix("www.").unwrap_or(&lower);
    stripped.replace('.', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let a = generate_key("GET", "http://example.com/x", "ua", "en");
        let b = generate_key("GET", "http://example.com/x", "ua", "en");
        assert_eq!(a, b);
    }

    #[test]
    fn key_changes_with_user_agent() {
        let a = generate_key("GET", "http://example.com/x", "ua-1", "en");
        let b = generate_key("GET", "http://example.com/x", "ua-2", "en");
        assert_ne!(a, b);
    }

    #[test]
    fn reordered_query_params_yield_identical_keys() {
        let a = generate_key("GET", "http://example.com/x?b=2&a=1", "ua", "en");
        let b = generate_key("GET", "http://example.com/x?a=1&b=2", "ua", "en");
        assert_eq!(a, b);
    }

    #[test]
    fn tracking_params_are_stripped_before_hashing() {
        let a = generate_key("GET", "http://example.com/x?a=1", "ua", "en");
        let b = generate_key(
            "GET",
            "http://example.com/x?a=1&utm_source=newsletter",
            "ua",
            "en",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn empty_headers_still_produce_a_valid_key() {
        let key = generate_key("GET", "http://example.com/x", "", "");
        assert!(key.starts_with("GET_"));
        assert_eq!(key.len(), "GET_".len() + 12);
    }

    #[test]
    fn normalize_url_is_idempotent() {
        let once = normalize_url("http://EXAMPLE.com/x?b=2&utm_source=foo&a=1");
        let twice = normalize_url(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn domain_dir_name_strips_www_and_dashes_dots() {
        assert_eq!(domain_dir_name("www.Example.com"), "example-com");
        assert_eq!(domain_dir_name("api.example.com"), "api-example-com");
    }
}
