//! Proxy engine: mode-routed dispatch for both plain forward-proxy HTTP and
//! the HTTPS MITM tunnel, plus the live upstream fetch both paths share.

pub mod mitm;
mod tls_client;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::cache::{self, CacheEntry, RequestMeta, ResponseMeta, Source, Store};
use crate::config::{self, Mode};
use crate::error::Error;
use crate::tls::CaManager;

pub type Body = BoxBody<Bytes, Infallible>;

/// Headers that apply only to a single transport hop and must never be
/// forwarded by a proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct Engine {
    pub store: Arc<Store>,
    pub ca: Arc<CaManager>,
    pub live_timeout: Duration,
}

impl Engine {
    pub fn new(store: Arc<Store>, ca: Arc<CaManager>, live_timeout: Duration) -> Self {
        Self {
            store,
            ca,
            live_timeout,
        }
    }
}

pub fn full_body(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

fn header_map_to_string_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Top-level entry point for a request arriving on the proxy plane: routes
/// `CONNECT` to the MITM tunnel and everything else through the mode
/// pipeline directly.
pub async fn handle(
    engine: Arc<Engine>,
    req: Request<Incoming>,
) -> Result<Response<Body>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(mitm::handle_connect(engine, req));
    }

    let url = request_url(&req, "http");
    let method = req.method().clone();
    let headers = req.headers().clone();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    Ok(dispatch(engine, method, url, headers, body).await)
}

/// Reconstructs the absolute URL for a request. Forward-proxy clients send
/// an absolute-URI request target directly; MITM'd requests arrive with a
/// path-only target and must be combined with the tunnel's SNI host.
pub fn request_url(req: &Request<Incoming>, default_scheme: &str) -> String {
    if req.uri().scheme().is_some() {
        return req.uri().to_string();
    }
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    format!("{default_scheme}://{host}{}", req.uri())
}

/// Routes a request through the mode pipeline described in the proxy's
/// component design: replay serves only from cache, record falls back to a
/// live fetch and persists it, live never touches the cache.
pub async fn dispatch(
    engine: Arc<Engine>,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let mode = config::mode();
    let user_agent = header_str(&headers, http::header::USER_AGENT);
    let accept_language = header_str(&headers, http::header::ACCEPT_LANGUAGE);
    let key = cache::generate_key(method.as_str(), &url, &user_agent, &accept_language);
    let domain = url::Url::parse(&url)
        .ok()
        .and_then(|u| u.host_str().map(cache::domain_dir_name))
        .unwrap_or_else(|| "unknown".to_string());

    match mode {
        Mode::Replay => match engine.store.lookup(&domain, &key).await {
            Ok(Some((entry, cached_body, source))) => {
                serve_cached(entry, cached_body, mode, source)
            }
            Ok(None) => cache_miss_response(mode, &url, &key),
            Err(e) => {
                log::error!("cache lookup failed for {url}: {e}");
                cache_miss_response(mode, &url, &key)
            }
        },
        Mode::Record => match engine.store.lookup(&domain, &key).await {
            Ok(Some((entry, cached_body, source))) => {
                serve_cached(entry, cached_body, mode, source)
            }
            Ok(None) | Err(_) => {
                match live_fetch(&engine, &method, &url, &headers, &body).await {
                    Ok((status, resp_headers, resp_body, was_compressed)) => {
                        let entry = CacheEntry {
                            request: RequestMeta {
                                method: method.to_string(),
                                url: url.clone(),
                                headers: header_map_to_string_map(&headers),
                            },
                            response: ResponseMeta {
                                status: status.as_u16(),
                                headers: resp_headers.clone(),
                                was_compressed,
                            },
                            recorded_at: Utc::now(),
                            cache_key: key.clone(),
                        };
                        if let Err(e) = engine.store.store(&domain, &entry, &resp_body).await {
                            log::warn!("failed to persist recorded entry for {url}: {e}");
                        }
                        build_response(status, &resp_headers, resp_body, mode, Some(Source::Cache))
                    }
                    Err(e) => upstream_error_response(mode, &url, &e),
                }
            }
        },
        Mode::Live => match live_fetch(&engine, &method, &url, &headers, &body).await {
            Ok((status, resp_headers, resp_body, _)) => {
                build_response(status, &resp_headers, resp_body, mode, None)
            }
            Err(e) => upstream_error_response(mode, &url, &e),
        },
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn serve_cached(entry: CacheEntry, body: Vec<u8>, mode: Mode, source: Source) -> Response<Body> {
    build_response(
        StatusCode::from_u16(entry.response.status).unwrap_or(StatusCode::OK),
        &entry.response.headers,
        body.into(),
        mode,
        Some(source),
    )
}

fn build_response(
    status: StatusCode,
    headers: &HashMap<String, String>,
    body: Bytes,
    mode: Mode,
    source: Option<Source>,
) -> Response<Body> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            if !is_hop_by_hop(&name) {
                builder = builder.header(name, value);
            }
        }
    }
    builder = builder.header("X-Proxy-Mode", mode.to_string());
    if let Some(source) = source {
        builder = builder.header("X-Proxy-Source", source.as_str());
    }
    builder
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

fn cache_miss_response(mode: Mode, url: &str, key: &str) -> Response<Body> {
    let payload = serde_json::json!({
        "error": "cache_miss",
        "mode": mode.to_string(),
        "url": url,
        "cache_key": key,
        "message": "no fixture or cache entry for this request",
    });
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Mode", mode.to_string())
        .header("X-Proxy-Cache-Miss", "true")
        .body(full_body(payload.to_string()))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

fn upstream_error_response(mode: Mode, url: &str, err: &Error) -> Response<Body> {
    log::warn!("upstream transport failure for {url}: {err}");
    let payload = serde_json::json!({
        "error": "upstream_transport",
        "mode": mode.to_string(),
        "url": url,
        "message": err.to_string(),
    });
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Mode", mode.to_string())
        .body(full_body(payload.to_string()))
        .unwrap_or_else(|_| Response::new(full_body(Bytes::new())))
}

enum Conn {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Executes a live fetch to the real upstream: copies method/url/headers
/// minus hop-by-hop fields, applies the configured timeout, and reads the
/// whole body into memory so record mode can persist it byte-identically.
pub async fn live_fetch(
    engine: &Engine,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(StatusCode, HashMap<String, String>, Bytes, bool), Error> {
    let fetch = async {
        let parsed = url::Url::parse(url)
            .map_err(|e| io_err(format!("invalid URL {url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| io_err(format!("URL has no host: {url}")))?
            .to_string();
        let is_https = parsed.scheme() == "https";
        let port = parsed.port().unwrap_or(if is_https { 443 } else { 80 });

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| io_err(format!("connect to {host}:{port} failed: {e}")))?;

        let conn = if is_https {
            let connector = TlsConnector::from(tls_client::client_config());
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| io_err(format!("invalid server name {host}: {e}")))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| io_err(format!("TLS handshake with {host} failed: {e}")))?;
            Conn::Tls(tls)
        } else {
            Conn::Plain(tcp)
        };

        let io = TokioIo::new(conn);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| io_err(format!("handshake with {host} failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("upstream connection closed: {e}");
            }
        });

        let path_and_query = parsed
            .query()
            .map(|q| format!("{}?{}", parsed.path(), q))
            .unwrap_or_else(|| parsed.path().to_string());

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path_and_query)
            .header(http::header::HOST, &host);
        for (name, value) in headers.iter() {
            if !is_hop_by_hop(name) && name != http::header::HOST {
                builder = builder.header(name, value);
            }
        }
        let outbound = builder
            .body(full_body(body.clone()))
            .map_err(|e| io_err(format!("failed to build outbound request: {e}")))?;

        let response = sender
            .send_request(outbound)
            .await
            .map_err(|e| io_err(format!("request to {host} failed: {e}")))?;

        let status = response.status();
        let was_compressed = response.headers().contains_key(http::header::CONTENT_ENCODING);
        let resp_headers = header_map_to_string_map(response.headers());
        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| io_err(format!("failed to read response body: {e}")))?;

        Ok::<_, std::io::Error>((status, resp_headers, collected.to_bytes(), was_compressed))
    };

    match tokio::time::timeout(engine.live_timeout, fetch).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(Error::UpstreamTransport {
            url: url.to_string(),
            source: Box::new(e),
        }),
        Err(_) => Err(Error::UpstreamTransport {
            url: url.to_string(),
            source: Box::new(io_err("live fetch timed out".to_string())),
        }),
    }
}

fn io_err(msg: String) -> std::io::Error {
    std::io::Error::other(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hop_by_hop_headers_are_recognized_case_insensitively() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }

    #[test]
    fn header_map_to_string_map_strips_hop_by_hop_entries() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        let mapped = header_map_to_string_map(&headers);
        assert_eq!(mapped.get("content-type").map(String::as_str), Some("text/html"));
        assert!(!mapped.contains_key("connection"));
    }

    #[test]
    fn cache_miss_response_carries_the_documented_envelope() {
        let resp = cache_miss_response(Mode::Replay, "http://notfound.example.com/x", "GET_abc");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers().get("X-Proxy-Cache-Miss").unwrap(),
            "true"
        );
        assert_eq!(resp.headers().get("X-Proxy-Mode").unwrap(), "replay");
    }

    #[tokio::test]
    async fn replay_hit_serves_fixture_body_and_source_header() {
        let fixtures = tempdir().unwrap();
        let cache = tempdir().unwrap();

        let method = "GET";
        let url = "http://example.com/x";
        let key = cache::generate_key(method, url, "", "");
        let dir = fixtures.path().join("example-com");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let entry = CacheEntry {
            request: RequestMeta {
                method: method.to_string(),
                url: url.to_string(),
                headers: HashMap::new(),
            },
            response: ResponseMeta {
                status: 200,
                headers: HashMap::from([("content-type".to_string(), "text/html".to_string())]),
                was_compressed: false,
            },
            recorded_at: Utc::now(),
            cache_key: key.clone(),
        };
        tokio::fs::write(
            dir.join(format!("{key}.json")),
            serde_json::to_vec(&entry).unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join(format!("{key}.body")), b"<html>ok</html>")
            .await
            .unwrap();

        let certs = tempdir().unwrap();
        let ca = Arc::new(CaManager::init(certs.path()).await.unwrap());
        let store = Arc::new(Store::new(fixtures.path(), cache.path()));
        let engine = Arc::new(Engine::new(store, ca, Duration::from_secs(5)));

        config::set_mode(Mode::Replay);
        let resp = dispatch(
            engine,
            Method::GET,
            url.to_string(),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("X-Proxy-Source").unwrap(), "fixtures");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<html>ok</html>");
    }

    #[tokio::test]
    async fn replay_miss_returns_structured_502() {
        let fixtures = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let certs = tempdir().unwrap();
        let ca = Arc::new(CaManager::init(certs.path()).await.unwrap());
        let store = Arc::new(Store::new(fixtures.path(), cache.path()));
        let engine = Arc::new(Engine::new(store, ca, Duration::from_secs(5)));

        config::set_mode(Mode::Replay);
        let resp = dispatch(
            engine,
            Method::GET,
            "http://notfound.example.com/missing".to_string(),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers().get("X-Proxy-Cache-Miss").unwrap(), "true");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "cache_miss");
        assert_eq!(json["mode"], "replay");
    }

    #[test]
    fn request_url_prefers_absolute_uri_then_falls_back_to_host_header() {
        let mut req = Request::builder()
            .uri("http://example.com/path")
            .body(())
            .unwrap();
        assert_eq!(request_url_test(&req, "http"), "http://example.com/path");

        *req.uri_mut() = "/path".parse().unwrap();
        req.headers_mut()
            .insert(http::header::HOST, HeaderValue::from_static("example.com"));
        assert_eq!(request_url_test(&req, "http"), "http://example.com/path");
    }

    fn request_url_test(req: &Request<()>, default_scheme: &str) -> String {
        if req.uri().scheme().is_some() {
            return req.uri().to_string();
        }
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        format!("{default_scheme}://{host}{}", req.uri())
    }
}
