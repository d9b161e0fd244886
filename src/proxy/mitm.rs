//! HTTPS MITM tunnel: hijacks the `CONNECT` socket, completes a TLS
//! handshake using a leaf certificate minted for the client's SNI, then
//! serves HTTP/1.1 requests over that stream through the same mode
//! pipeline as plain forward-proxy traffic.

use std::sync::Arc;

use http::{Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Version};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use tokio_rustls::LazyConfigAcceptor;

use super::{dispatch, full_body, Body, Engine};

/// Responds `200 Connection Established`, then takes over the raw socket
/// once the client has observed that response. Errors during the tunnel
/// are logged and never surfaced to the (unrelated) upstream.
pub fn handle_connect(engine: Arc<Engine>, req: Request<Incoming>) -> Response<Body> {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = serve_tls_tunnel(engine, upgraded, &authority).await {
                    log::warn!("MITM tunnel for {authority} failed: {e}");
                }
            }
            Err(e) => log::warn!("failed to upgrade CONNECT for {authority}: {e}"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(full_body(Vec::new()))
        .unwrap_or_else(|_| Response::new(full_body(Vec::new())))
}

async fn serve_tls_tunnel(
    engine: Arc<Engine>,
    upgraded: hyper::upgrade::Upgraded,
    authority: &str,
) -> std::io::Result<()> {
    let io = TokioIo::new(upgraded);

    let handshake = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), io)
        .await
        .map_err(|e| std::io::Error::other(format!("client hello read failed: {e}")))?;

    let sni = handshake
        .client_hello()
        .server_name()
        .map(|s| s.to_string())
        .unwrap_or_else(|| authority.split(':').next().unwrap_or(authority).to_string());

    let server_config = engine
        .ca
        .server_config_for_host(&sni)
        .map_err(|e| std::io::Error::other(format!("cert mint failed for {sni}: {e}")))?;

    let tls_stream = handshake
        .into_stream(server_config)
        .await
        .map_err(|e| std::io::Error::other(format!("TLS handshake failed for {sni}: {e}")))?;

    let io = TokioIo::new(tls_stream);
    let sni = Arc::new(sni);
    let sni_for_error = sni.clone();

    let service = service_fn(move |req: Request<Incoming>| {
        let engine = engine.clone();
        let sni = sni.clone();
        async move {
            let url = request_url_for_tunnel(&req, &sni);
            let method = req.method().clone();
            let headers = req.headers().clone();
            let body = match http_body_util::BodyExt::collect(req.into_body()).await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => bytes::Bytes::new(),
            };
            Ok::<_, std::convert::Infallible>(dispatch(engine, method, url, headers, body).await)
        }
    });

    auto::Builder::new(hyper_util::rt::TokioExecutor::new())
        .http1_only()
        .serve_connection(io, service)
        .await
        .map_err(|e| std::io::Error::other(format!("serve error for {sni_for_error}: {e}")))?;

    Ok(())
}

fn request_url_for_tunnel(req: &Request<Incoming>, sni: &str) -> String {
    if req.version() >= Version::HTTP_11 && req.uri().scheme().is_some() {
        return req.uri().to_string();
    }
    format!("https://{sni}{}", req.uri())
}
