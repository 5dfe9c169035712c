//! Shared helpers: a fake module speaking the command protocol and raw HTTP clients

#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use modhub::access_log::AccessLog;
use modhub::config::Config;
use modhub::hub::Hub;
use modhub::process::ProcessLauncher;
use modhub::server::HubServer;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const SECRET: &str = "integration-shared-secret";

/// In-process stand-in for a module
pub struct FakeModule {
    pub name: String,
    pub port: u16,
    /// Set once `Shutdown` was received; pings fail afterwards
    pub stopped: AtomicBool,
    pub commands: Mutex<Vec<String>>,
}

impl FakeModule {
    pub async fn spawn(name: &str) -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let module = Arc::new(Self {
            name: name.to_string(),
            port,
            stopped: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
        });

        let server = Arc::clone(&module);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                let module = Arc::clone(&server);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let module = Arc::clone(&module);
                        async move { Ok::<_, Infallible>(module.answer(req).await) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        module
    }

    /// Answer pings again after a `Shutdown`, like a relaunched instance
    pub fn resume(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    async fn answer(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        let host = header(&req, "host");
        let user = header(&req, "x-authenticated-user");
        let forwarded = header(&req, "x-forwarded-for");

        if path == "/cmd" {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let command = json["command"].as_str().unwrap_or_default().to_string();
            self.commands.lock().push(command.clone());

            return match command.as_str() {
                "Ping" if self.stopped.load(Ordering::SeqCst) => {
                    reply(StatusCode::SERVICE_UNAVAILABLE, "stopping".to_string())
                }
                "Ping" => reply(StatusCode::OK, format!("{} ALIVE", self.name)),
                "Shutdown" => {
                    self.stopped.store(true, Ordering::SeqCst);
                    let ack = serde_json::json!({"name": self.name, "ack": "Shutdown"});
                    reply(StatusCode::OK, ack.to_string())
                }
                "Greet" => reply(
                    StatusCode::OK,
                    format!("hello {}", json["content"].as_str().unwrap_or_default()),
                ),
                _ => reply(StatusCode::NOT_FOUND, "unknown".to_string()),
            };
        }

        if path.contains("missing") {
            return reply(StatusCode::NOT_FOUND, "no such page".to_string());
        }

        reply(
            StatusCode::OK,
            format!("path={} host={} user={} forwarded={}", path, host, user, forwarded),
        )
    }
}

fn header(req: &Request<Incoming>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

fn reply(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Parse a TOML config with quick liveness settings applied
pub fn config_from_toml(toml: &str, dir: &std::path::Path) -> Config {
    let mut config: Config = toml::from_str(toml).unwrap();
    config.validate().unwrap();
    config.mods_dir = dir.join("mods");
    config.access_log = dir.join("access.log");
    config.handshake.settle_delay_ms = 20;
    config.handshake.ping_attempts = 5;
    config.handshake.ping_interval_ms = 50;
    config.server.shutdown_grace_secs = 2;
    config
}

pub struct RunningHub {
    pub hub: Arc<Hub>,
    pub port: u16,
    pub server: JoinHandle<anyhow::Result<()>>,
}

/// Start a hub on an ephemeral port and run the module setup pass
pub async fn start_hub(config: Config) -> RunningHub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let launcher = Arc::new(ProcessLauncher::new(format!("http://{}", addr)));
    let hub = Hub::new(
        config,
        SECRET.to_string(),
        launcher,
        Arc::new(AccessLog::disabled()),
    )
    .unwrap();
    hub.load_modules().await;

    let server = tokio::spawn(HubServer::new(addr, Arc::clone(&hub)).serve(listener));
    RunningHub {
        hub,
        port: addr.port(),
        server,
    }
}

/// Send a simple HTTP request and get response
pub async fn http_get(port: u16, path: &str) -> String {
    http_get_with_headers(port, path, &[]).await
}

pub async fn http_get_with_headers(port: u16, path: &str, headers: &[(&str, &str)]) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n",
        path, port
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

pub async fn http_post_json(port: u16, path: &str, body: &serde_json::Value) -> String {
    let body = body.to_string();
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await.unwrap();
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        port,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

pub fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

pub fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

/// Poll `path` until it answers `status`
pub async fn wait_for_status(port: u16, path: &str, status: u16) -> String {
    let mut last = String::new();
    for _ in 0..100 {
        last = http_get(port, path).await;
        if status_of(&last) == status {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never answered {}, last response:\n{}", path, status, last);
}
