use crate::daemon::Daemon;
use anyhow::{Context, Result};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Start the HTTP status server on `addr`.
///
/// Serves `/metrics` (Prometheus text), `/health` and `/status` (JSON).
/// `POST /sync` rescans all interfaces, `POST /restart` restarts all peer sessions.
/// Both are only accepted from loopback addresses.
pub async fn serve(daemon: Arc<Daemon>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server on {addr}"))?;

    info!("📈 Status server listening on http://{}/metrics", addr);
    serve_listener(daemon, listener).await
}

pub async fn serve_listener(daemon: Arc<Daemon>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let daemon = Arc::clone(&daemon);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let daemon = Arc::clone(&daemon);
                handle_request(req, daemon, remote)
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);

            if let Err(e) = conn.await {
                error!("Connection error: {}", e);
            }
        });
    }
}

fn respond(status: StatusCode, content_type: &str, body: String) -> Response<String> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    if let Ok(v) = content_type.parse() {
        resp.headers_mut().insert(hyper::header::CONTENT_TYPE, v);
    }
    resp
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    daemon: Arc<Daemon>,
    remote: SocketAddr,
) -> Result<Response<String>, Infallible> {
    if req.method() == Method::POST && !remote.ip().is_loopback() {
        return Ok(respond(StatusCode::FORBIDDEN, "text/plain", "Forbidden".to_string()));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let resp = match (&method, path.as_str()) {
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            daemon.metrics().to_prometheus(),
        ),
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "OK".to_string()),
        (&Method::GET, "/status") => match serde_json::to_string_pretty(&daemon.statuses()) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
        },
        (&Method::POST, "/sync") => {
            daemon.sync_all().await;
            let body = serde_json::json!({ "interfaces": daemon.statuses().len() });
            respond(StatusCode::OK, "application/json", body.to_string())
        }
        (&Method::POST, "/restart") => {
            let body = serde_json::json!({ "restarted": daemon.restart() });
            respond(StatusCode::OK, "application/json", body.to_string())
        }
        (_, "/metrics" | "/health" | "/status" | "/sync" | "/restart") => respond(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "Method Not Allowed".to_string(),
        ),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, InterfaceSettings};
    use crate::wg::testing::MemoryDevice;
    use crate::wg::Client;

    async fn start() -> (Arc<Daemon>, String) {
        let mut config = Config::default();
        config.signaling.backends = vec!["inprocess:".to_string()];
        config.daemon.interface_filter = "wg-http*".to_string();
        config.interface = InterfaceSettings {
            auto_config: false,
            sync_routes: false,
            sync_hosts: false,
            discover_endpoints: false,
            discover_peers: false,
            ..InterfaceSettings::default()
        };
        let daemon = Daemon::new(config, Arc::new(Client::local_only())).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve_listener(Arc::clone(&daemon), listener));
        (daemon, base)
    }

    async fn get(url: String) -> reqwest::Response {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        client.get(url).send().await.unwrap()
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (_daemon, base) = start().await;

        let health = get(format!("{base}/health")).await;
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "OK");

        let metrics = get(format!("{base}/metrics")).await;
        assert_eq!(metrics.status(), 200);
        assert!(metrics.text().await.unwrap().contains("# TYPE icewire_interfaces gauge"));

        let missing = get(format!("{base}/nope")).await;
        assert_eq!(missing.status(), 404);
    }

    async fn post(url: String) -> reqwest::Response {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        client.post(url).send().await.unwrap()
    }

    #[tokio::test]
    async fn test_sync_and_restart() {
        let (daemon, base) = start().await;
        daemon.client().register(MemoryDevice::new("wg-http1", 51820));
        assert!(daemon.interface("wg-http1").is_none());

        let resp = post(format!("{base}/sync")).await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["interfaces"], 1);
        assert!(daemon.interface("wg-http1").is_some());

        // Endpoint discovery is off, so there are no sessions
        let body: serde_json::Value = post(format!("{base}/restart")).await.json().await.unwrap();
        assert_eq!(body["restarted"], 0);

        assert_eq!(get(format!("{base}/sync")).await.status(), 405);
        assert_eq!(post(format!("{base}/status")).await.status(), 405);
        assert_eq!(post(format!("{base}/nope")).await.status(), 404);
    }

    #[tokio::test]
    async fn test_status() {
        let (daemon, base) = start().await;
        daemon.client().register(MemoryDevice::new("wg-http0", 51820));
        daemon.sync_devices().await;

        let body: serde_json::Value = get(format!("{base}/status"))
            .await
            .json()
            .await
            .unwrap();
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["name"], "wg-http0");
        assert_eq!(list[0]["listenPort"], 51820);
    }
}
