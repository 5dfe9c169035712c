use crate::hub::Hub;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// The gateway's listener: one task per connection, drained on shutdown
pub struct HubServer {
    bind_addr: SocketAddr,
    hub: Arc<Hub>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    grace: Duration,
}

impl HubServer {
    pub fn new(bind_addr: SocketAddr, hub: Arc<Hub>) -> Self {
        let shutdown_rx = hub.subscribe_shutdown();
        let grace = hub.config().server.shutdown_grace();
        Self {
            bind_addr,
            hub,
            shutdown_rx,
            tls_acceptor: None,
            grace,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Accept on an already bound listener until the shutdown trigger fires
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let hub = Arc::clone(&self.hub);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let shutdown = self.shutdown_rx.clone();

                            connections.spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, hub, true, shutdown).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, hub, false, shutdown).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!(
            open_connections = connections.len(),
            grace_secs = self.grace.as_secs(),
            "Gateway shutting down, draining connections"
        );
        let drained = tokio::time::timeout(self.grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "Grace period elapsed, closing remaining connections");
            connections.abort_all();
        }
        self.hub.abort_confirmations();

        info!("Gateway stopped");
        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    hub: Arc<Hub>,
    is_tls: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let hub = Arc::clone(&hub);
        async move {
            let req = req.map(|body| body.boxed());
            Ok::<_, Infallible>(hub.handle(req, addr, is_tls).await)
        }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            return result.map_err(|e| anyhow::anyhow!("Connection error: {}", e));
        }
        _ = shutdown_rx.wait_for(|stop| *stop) => {
            conn.as_mut().graceful_shutdown();
        }
    }

    conn.await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

pub fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

pub fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    while let Some(item) = rustls_pemfile::read_one(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
    {
        match item {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(key.into()),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(key.into()),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(key.into()),
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

/// TLS acceptor for the gateway listener, advertising h2 and http/1.1
pub fn tls_acceptor(cert: &str, key: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
