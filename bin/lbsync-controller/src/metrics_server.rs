//! HTTP endpoint for metrics and health checks

use anyhow::Result;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{
    body::Bytes, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use lbsync_core::SyncMetrics;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Serve `/metrics`, `/healthz` and `/readyz` on `addr`
///
/// `/readyz` reports 503 until `synced` is set by the initial reconcile.
pub async fn serve(addr: SocketAddr, metrics: SyncMetrics, synced: Arc<AtomicBool>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics listening on {}", addr);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        let synced = synced.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                let synced = synced.clone();
                async move { Ok::<_, Infallible>(handle(&req, &metrics, &synced)) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving metrics connection from {}: {}", peer_addr, e);
            }
        });
    }
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

fn handle<B>(
    req: &Request<B>,
    metrics: &SyncMetrics,
    synced: &AtomicBool,
) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n".to_string());
    }

    match req.uri().path() {
        "/metrics" => match metrics.gather() {
            Ok(body) => {
                let mut response = text(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n".to_string())
            }
        },
        "/healthz" => text(StatusCode::OK, "OK\n".to_string()),
        "/readyz" if synced.load(Ordering::Relaxed) => text(StatusCode::OK, "OK\n".to_string()),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "Initial sync pending\n".to_string()),
        _ => text(StatusCode::NOT_FOUND, "Not found\n".to_string()),
    }
}
