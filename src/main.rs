use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use nc_http_proxy::admin::AdminApp;
use nc_http_proxy::cache::Store;
use nc_http_proxy::config::Config;
use nc_http_proxy::proxy::{self, Engine};
use nc_http_proxy::sse::{self, Broker};
use nc_http_proxy::tls::CaManager;
use tokio::net::TcpListener;

const SSE_MAX_CLIENTS: usize = 256;
const SSE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    nc_http_proxy::logging::init();

    let config = Config::load();
    log::info!(
        "starting nc-http-proxy on port {} (fixtures={}, cache={}, certs={})",
        config.port,
        config.fixtures_dir,
        config.cache_dir,
        config.certs_dir,
    );

    let store = Arc::new(Store::new(&config.fixtures_dir, &config.cache_dir));
    let ca = match CaManager::init(&config.certs_dir).await {
        Ok(ca) => Arc::new(ca),
        Err(e) => {
            log::error!("failed to initialize TLS CA: {e}");
            std::process::exit(1);
        }
    };
    let engine = Arc::new(Engine::new(store.clone(), ca, config.live_timeout));
    let admin = Arc::new(AdminApp::new(store));
    let broker = Arc::new(Broker::new(SSE_MAX_CLIENTS, SSE_SHUTDOWN_TIMEOUT));
    broker.start().await;

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind port {}: {e}", config.port);
            std::process::exit(1);
        }
    };

    log::info!("listening on {}", listener.local_addr().unwrap());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        continue;
                    }
                };

                let engine = engine.clone();
                let admin = admin.clone();
                let broker = broker.clone();

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let engine = engine.clone();
                        let admin = admin.clone();
                        let broker = broker.clone();
                        async move { route(engine, admin, broker, req).await }
                    });

                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, service)
                        .await
                    {
                        log::debug!("connection from {peer} closed: {e}");
                    }
                });
            }
            _ = &mut shutdown => {
                log::info!("shutdown signal received, draining in-flight connections");
                break;
            }
        }
    }

    let _ = tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, broker.stop()).await;
    log::info!("shutdown complete");
}

async fn route(
    engine: Arc<Engine>,
    admin: Arc<AdminApp>,
    broker: Arc<Broker>,
    req: Request<Incoming>,
) -> Result<hyper::Response<proxy::Body>, Infallible> {
    let path = req.uri().path();

    if path == "/events" {
        return Ok(sse::http::serve(&broker, sse::SubscribeOptions::default()).await);
    }
    if AdminApp::claims(path) {
        return admin.handle(req).await;
    }
    proxy::handle(engine, req).await
}
