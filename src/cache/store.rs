//! Two-tier content-addressed cache store: a read-only `fixtures` tier
//! checked ahead of a writable `cache` tier. Each entry is a pair of sibling
//! files, `{key}.json` (metadata) and `{key}.body` (raw bytes).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Fixtures,
    Cache,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Fixtures => "fixtures",
            Source::Cache => "cache",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    pub was_compressed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub request: RequestMeta,
    pub response: ResponseMeta,
    pub recorded_at: DateTime<Utc>,
    pub cache_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub fixtures_count: usize,
    pub cache_count: usize,
    pub domains: Vec<String>,
}

/// Shared read / exclusive write over the on-disk cache tiers. A request
/// does not hold this lock across its network fetch; it only guards the
/// file-system operations themselves.
pub struct Store {
    fixtures_dir: PathBuf,
    cache_dir: PathBuf,
    lock: RwLock<()>,
}

impl Store {
    pub fn new(fixtures_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_dir: fixtures_dir.into(),
            cache_dir: cache_dir.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn fixtures_dir(&self) -> &Path {
        &self.fixtures_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Looks up `domain/key`, checking fixtures before the user cache. A
    /// lone metadata or body file is treated as a miss, never an error.
    pub async fn lookup(
        &self,
        domain: &str,
        key: &str,
    ) -> Result<Option<(CacheEntry, Vec<u8>, Source)>> {
        let _guard = self.lock.read().await;

        if let Some(found) = read_entry(&self.fixtures_dir, domain, key).await? {
            return Ok(Some((found.0, found.1, Source::Fixtures)));
        }
        if let Some(found) = read_entry(&self.cache_dir, domain, key).await? {
            return Ok(Some((found.0, found.1, Source::Cache)));
        }
        Ok(None)
    }

    /// Writes `entry`/`body` into the user cache tier. Metadata is written
    /// before the body; a crash between the two leaves a partial entry that
    /// the next `lookup` treats as a miss rather than as corruption.
    pub async fn store(&self, domain: &str, entry: &CacheEntry, body: &[u8]) -> Result<()> {
        let _guard = self.lock.write().await;

        let dir = self.cache_dir.join(domain);
        fs::create_dir_all(&dir).await?;
        set_permissions(&dir, 0o750).await?;

        let json_path = dir.join(format!("{}.json", entry.cache_key));
        let body_path = dir.join(format!("{}.body", entry.cache_key));

        let json = serde_json::to_vec_pretty(entry)
            .map_err(|e| Error::Config(format!("failed to encode cache metadata: {e}")))?;
        fs::write(&json_path, &json).await?;
        set_permissions(&json_path, 0o600).await?;

        fs::write(&body_path, body).await?;
        set_permissions(&body_path, 0o600).await?;

        Ok(())
    }

    /// Counts metadata files per tier and returns the union of domain
    /// directories across both.
    pub async fn stats(&self) -> Result<Stats> {
        let _guard = self.lock.read().await;

        let fixtures_count = count_entries(&self.fixtures_dir).await?;
        let cache_count = count_entries(&self.cache_dir).await?;

        let mut domains: BTreeSet<String> = BTreeSet::new();
        domains.extend(list_dir_names(&self.fixtures_dir).await?);
        domains.extend(list_dir_names(&self.cache_dir).await?);

        Ok(Stats {
            fixtures_count,
            cache_count,
            domains: domains.into_iter().collect(),
        })
    }

    /// Lists the union of cache keys for `domain` across both tiers.
    pub async fn list_keys(&self, domain: &str) -> Result<Vec<String>> {
        let _guard = self.lock.read().await;

        let mut keys: BTreeSet<String> = BTreeSet::new();
        keys.extend(list_keys_in(&self.fixtures_dir.join(domain)).await?);
        keys.extend(list_keys_in(&self.cache_dir.join(domain)).await?);
        Ok(keys.into_iter().collect())
    }

    /// Clears the entire user cache tier. Fixtures are never touched.
    pub async fn clear_all(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        if fs::metadata(&self.cache_dir).await.is_ok() {
            fs::remove_dir_all(&self.cache_dir).await?;
            fs::create_dir_all(&self.cache_dir).await?;
        }
        Ok(())
    }

    /// Clears a single domain under the user cache tier.
    pub async fn clear_domain(&self, domain: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let dir = self.cache_dir.join(domain);
        if fs::metadata(&dir).await.is_ok() {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

async fn read_entry(
    base: &Path,
    domain: &str,
    key: &str,
) -> Result<Option<(CacheEntry, Vec<u8>)>> {
    let dir = base.join(domain);
    let json_path = dir.join(format!("{key}.json"));
    let body_path = dir.join(format!("{key}.body"));

    let json = match fs::read(&json_path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let body = match fs::read(&body_path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let entry: CacheEntry = serde_json::from_slice(&json)
        .map_err(|e| Error::Config(format!("corrupt cache metadata at {json_path:?}: {e}")))?;

    Ok(Some((entry, body)))
}

async fn count_entries(base: &Path) -> Result<usize> {
    let mut count = 0;
    let mut domains = match fs::read_dir(base).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(domain_entry) = domains.next_entry().await? {
        if !domain_entry.file_type().await?.is_dir() {
            continue;
        }
        let mut files = fs::read_dir(domain_entry.path()).await?;
        while let Some(file) = files.next_entry().await? {
            if file.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
    }
    Ok(count)
}

async fn list_dir_names(base: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(base).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

async fn list_keys_in(dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
    }
    Ok(keys)
}

#[cfg(unix)]
async fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let perms = std::fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn sample_entry(key: &str) -> CacheEntry {
        CacheEntry {
            request: RequestMeta {
                method: "GET".to_string(),
                url: "http://example.com/x".to_string(),
                headers: HashMap::new(),
            },
            response: ResponseMeta {
                status: 200,
                headers: HashMap::new(),
                was_compressed: false,
            },
            recorded_at: Utc::now(),
            cache_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn store_then_lookup_round_trips_body_and_metadata() {
        let fixtures = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let store = Store::new(fixtures.path(), cache.path());

        let entry = sample_entry("GET_abc123456789");
        store.store("example-com", &entry, b"hello").await.unwrap();

        let (found, body, source) = store
            .lookup("example-com", "GET_abc123456789")
            .await
            .unwrap()
            .expect("entry should be found");

        assert_eq!(body, b"hello");
        assert_eq!(found.cache_key, entry.cache_key);
        assert_eq!(source.as_str(), "cache");
    }

    #[tokio::test]
    async fn fixtures_take_precedence_over_cache() {
        let fixtures = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let store = Store::new(fixtures.path(), cache.path());

        let dir = fixtures.path().join("example-com");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let entry = sample_entry("GET_abc123456789");
        tokio::fs::write(
            dir.join("GET_abc123456789.json"),
            serde_json::to_vec(&entry).unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("GET_abc123456789.body"), b"from-fixtures")
            .await
            .unwrap();

        store
            .store("example-com", &sample_entry("GET_abc123456789"), b"from-cache")
            .await
            .unwrap();

        let (_, body, source) = store
            .lookup("example-com", "GET_abc123456789")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"from-fixtures");
        assert_eq!(source.as_str(), "fixtures");
    }

    #[tokio::test]
    async fn lone_metadata_file_is_a_miss_not_an_error() {
        let fixtures = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let store = Store::new(fixtures.path(), cache.path());

        let dir = cache.path().join("example-com");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("GET_abc123456789.json"),
            serde_json::to_vec(&sample_entry("GET_abc123456789")).unwrap(),
        )
        .await
        .unwrap();

        let result = store.lookup("example-com", "GET_abc123456789").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn clear_all_removes_cache_but_never_fixtures() {
        let fixtures = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let store = Store::new(fixtures.path(), cache.path());

        let entry = sample_entry("GET_abc123456789");
        store.store("example-com", &entry, b"body").await.unwrap();
        store.clear_all().await.unwrap();

        let result = store.lookup("example-com", "GET_abc123456789").await.unwrap();
        assert!(result.is_none());
    }
}
