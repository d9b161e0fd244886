//! Admin HTTP surface: mode switch, cache inspection/clear, health and
//! status. A plain mux distinct from the proxy plane, following this
//! codebase's existing admin-resource router idiom but narrowed to this
//! crate's fixed endpoint table instead of a generic CRUD-resource
//! abstraction (there is no etcd-backed resource store here).

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Response, StatusCode};
use hyper::body::Incoming;
use hyper::Request;
use matchit::Router;
use serde_json::json;

use crate::cache::Store;
use crate::config::{self, Mode};
use crate::proxy::{full_body, Body};

#[derive(Debug)]
enum ApiError {
    InvalidMode(String),
    PathTraversal(String),
    Internal(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::InvalidMode(msg) => write!(f, "invalid mode: {msg}"),
            ApiError::PathTraversal(msg) => write!(f, "path traversal: {msg}"),
            ApiError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl ApiError {
    fn into_response(self) -> Response<Body> {
        let status = match &self {
            ApiError::InvalidMode(_) | ApiError::PathTraversal(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        json_response(status, json!({ "error": self.to_string(), "message": self.to_string() }))
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

/// Verifies a user-supplied domain segment cannot escape `base`: rejects
/// any segment containing `..`, then checks the joined path is still
/// rooted under `base`.
fn safe_domain_path(base: &Path, domain: &str) -> ApiResult<std::path::PathBuf> {
    if domain.contains("..") || domain.starts_with('/') {
        return Err(ApiError::PathTraversal(domain.to_string()));
    }
    let joined = base.join(domain);
    let base_str = base.to_string_lossy();
    let joined_str = joined.to_string_lossy();
    if joined_str != base_str && !joined_str.starts_with(&format!("{base_str}/")) {
        return Err(ApiError::PathTraversal(domain.to_string()));
    }
    Ok(joined)
}

pub struct AdminApp {
    store: Arc<Store>,
    router: Router<&'static str>,
}

impl AdminApp {
    pub fn new(store: Arc<Store>) -> Self {
        let mut router = Router::new();
        router.insert("/health", "health").unwrap();
        router.insert("/admin/status", "status").unwrap();
        router.insert("/admin/mode/{mode}", "mode").unwrap();
        router.insert("/admin/cache", "cache_root").unwrap();
        router.insert("/admin/cache/{domain}", "cache_domain").unwrap();
        Self { store, router }
    }

    /// Returns `true` for any request this mux claims — `/health` and
    /// everything under `/admin/`. All other paths (and all `CONNECT`
    /// requests) belong to the proxy plane.
    pub fn claims(path: &str) -> bool {
        path == "/health" || path.starts_with("/admin/")
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        let matched = match self.router.at(&path) {
            Ok(m) => m,
            Err(_) => {
                return Ok(json_response(
                    StatusCode::NOT_FOUND,
                    json!({ "error": "not_found", "message": "no such admin endpoint" }),
                ))
            }
        };

        let params: HashMap<String, String> = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let result = match (*matched.value, &method) {
            ("health", &Method::GET) => Ok(Response::new(full_body("OK"))),
            ("status", &Method::GET) => self.status().await,
            ("mode", &Method::POST) => self.set_mode(&params),
            ("cache_root", &Method::GET) => self.list_domains().await,
            ("cache_root", &Method::DELETE) => self.clear_all().await,
            ("cache_domain", &Method::GET) => self.list_keys(&params).await,
            ("cache_domain", &Method::DELETE) => self.clear_domain(&params).await,
            _ => {
                return Ok(json_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    json!({ "error": "method_not_allowed", "message": "unsupported method for this endpoint" }),
                ))
            }
        };

        Ok(result.unwrap_or_else(ApiError::into_response))
    }

    async fn status(&self) -> ApiResult<Response<Body>> {
        let stats = self
            .store
            .stats()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(json_response(
            StatusCode::OK,
            json!({
                "mode": config::mode().to_string(),
                "fixtures_count": stats.fixtures_count,
                "cache_count": stats.cache_count,
                "domains": stats.domains,
            }),
        ))
    }

    fn set_mode(&self, params: &HashMap<String, String>) -> ApiResult<Response<Body>> {
        let raw = params
            .get("mode")
            .ok_or_else(|| ApiError::InvalidMode("missing mode segment".to_string()))?;
        let mode: Mode = raw
            .parse()
            .map_err(|_| ApiError::InvalidMode(raw.clone()))?;
        config::set_mode(mode);
        Ok(json_response(
            StatusCode::OK,
            json!({ "mode": mode.to_string(), "message": "mode updated" }),
        ))
    }

    async fn list_domains(&self) -> ApiResult<Response<Body>> {
        let stats = self
            .store
            .stats()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(json_response(StatusCode::OK, json!(stats.domains)))
    }

    async fn clear_all(&self) -> ApiResult<Response<Body>> {
        self.store
            .clear_all()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(json_response(
            StatusCode::OK,
            json!({ "message": "user cache cleared" }),
        ))
    }

    async fn list_keys(&self, params: &HashMap<String, String>) -> ApiResult<Response<Body>> {
        let domain = params
            .get("domain")
            .ok_or_else(|| ApiError::Internal("missing domain segment".to_string()))?;
        safe_domain_path(self.store.cache_dir(), domain)?;
        let keys = self
            .store
            .list_keys(domain)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(json_response(StatusCode::OK, json!(keys)))
    }

    async fn clear_domain(&self, params: &HashMap<String, String>) -> ApiResult<Response<Body>> {
        let domain = params
            .get("domain")
            .ok_or_else(|| ApiError::Internal("missing domain segment".to_string()))?;
        safe_domain_path(self.store.cache_dir(), domain)?;
        self.store
            .clear_domain(domain)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(json_response(
            StatusCode::OK,
            json!({ "message": format!("cache cleared for domain {domain}") }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn safe_domain_path_rejects_parent_traversal() {
        let base = Path::new("/app/cache");
        assert!(safe_domain_path(base, "../etc").is_err());
        assert!(safe_domain_path(base, "foo/../../etc").is_err());
    }

    #[test]
    fn safe_domain_path_accepts_plain_domain_segment() {
        let base = Path::new("/app/cache");
        assert!(safe_domain_path(base, "example-com").is_ok());
    }

    #[tokio::test]
    async fn status_reports_current_mode_and_domain_counts() {
        let fixtures = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let store = Arc::new(Store::new(fixtures.path(), cache.path()));
        let app = AdminApp::new(store);
        let resp = app.status().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn claims_admin_and_health_paths_only() {
        assert!(AdminApp::claims("/health"));
        assert!(AdminApp::claims("/admin/status"));
        assert!(!AdminApp::claims("/proxy/anything"));
    }
}
