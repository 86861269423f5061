//! HTTP probe server for Kubernetes.
//!
//! Runs beside the proxy on its own port. `/healthz` (liveness) always
//! answers 200; `/readyz` (readiness) answers 503 until the proxy
//! listener has been brought up, so the pod only receives traffic once
//! it can actually route.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

/// Handles one probe request against the shared readiness flag.
pub async fn probe_handler(
    req: Request<hyper::body::Incoming>,
    ready: &AtomicBool,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = match req.uri().path() {
        "/healthz" => (StatusCode::OK, "ok"),
        "/readyz" => {
            if ready.load(Ordering::Acquire) {
                (StatusCode::OK, "ok")
            } else {
                (StatusCode::SERVICE_UNAVAILABLE, "starting")
            }
        }
        _ => (StatusCode::NOT_FOUND, "not found"),
    };
    let response = Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default();
    Ok(response)
}

/// Serves probes on `addr` until the process exits.
pub async fn start_probe_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "probe server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ready = Arc::clone(&ready);

        tokio::spawn(async move {
            let service = service_fn(|req| {
                let ready = Arc::clone(&ready);
                async move { probe_handler(req, &ready).await }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "probe connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;

    /// Probe responses are checked through the real server since
    /// `hyper::body::Incoming` cannot be constructed directly.

    async fn spawn_server(ready: bool) -> (SocketAddr, Arc<AtomicBool>, tokio::task::JoinHandle<()>) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let flag = Arc::new(AtomicBool::new(ready));
        let server_flag = Arc::clone(&flag);
        let handle = tokio::spawn(async move {
            let _ = start_probe_server(addr, server_flag).await;
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        (addr, flag, handle)
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let (addr, _flag, handle) = spawn_server(false).await;

        let response = http_get(&format!("http://{}/healthz", addr)).await;
        assert_eq!(response.0, 200);
        assert_eq!(response.1, "ok");

        handle.abort();
    }

    #[tokio::test]
    async fn test_readyz_reflects_readiness_flag() {
        let (addr, flag, handle) = spawn_server(false).await;

        let response = http_get(&format!("http://{}/readyz", addr)).await;
        assert_eq!(response.0, 503);

        flag.store(true, Ordering::Release);
        let response = http_get(&format!("http://{}/readyz", addr)).await;
        assert_eq!(response.0, 200);
        assert_eq!(response.1, "ok");

        handle.abort();
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let (addr, _flag, handle) = spawn_server(true).await;

        let response = http_get(&format!("http://{}/foo", addr)).await;
        assert_eq!(response.0, 404);

        handle.abort();
    }

    /// Minimal HTTP GET over a raw TcpStream.
    async fn http_get(url: &str) -> (u16, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let url = url.strip_prefix("http://").unwrap();
        let (addr, path) = url.split_once('/').unwrap_or((url, ""));
        let path = format!("/{}", path);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let status_line = response.lines().next().unwrap();
        let status_code: u16 = status_line
            .split_whitespace()
            .nth(1)
            .unwrap()
            .parse()
            .unwrap();

        let body = response
            .split("\r\n\r\n")
            .nth(1)
            .unwrap_or("")
            .to_string();

        (status_code, body)
    }
}
