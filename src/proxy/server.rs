use super::forward::{is_websocket_upgrade, Forwarder, SlotGuard, StreamedBody};
use crate::error::ProxyError;
use crate::lb::RequestContext;
use crate::service::{normalize_host, Location, ServiceManager};
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// HTTP body type for responses
type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Bounded in-request retries after a transport failure
const MAX_RETRIES: u32 = 3;

/// The data-plane server: accepts connections, routes each request to a
/// location, drives the selection policy and forwards with retry.
pub struct ProxyServer {
    manager: Arc<ServiceManager>,
    forwarder: Forwarder,
    /// Connections currently being served, for drain on shutdown
    active: AtomicUsize,
}

impl ProxyServer {
    pub fn new(manager: Arc<ServiceManager>) -> Result<Self> {
        let config = manager.config();
        let forwarder = Forwarder::new(&config.connection_pool)?;
        Ok(Self {
            manager,
            forwarder,
            active: AtomicUsize::new(0),
        })
    }

    /// Bind the configured ports and serve until the shutdown signal
    /// fires. The data port speaks TLS when any service carries a TLS
    /// identity; the optional secondary port always speaks plain HTTP.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = self.manager.config();

        let data_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(data_addr)
            .await
            .context(format!("Failed to bind to {}", data_addr))?;

        let tls_acceptor = self.build_tls_acceptor()?;
        let scheme = if tls_acceptor.is_some() { "https" } else { "http" };
        info!("proxy listening on {} ({})", data_addr, scheme);

        if let Some(http_port) = config.http_port {
            let plain_addr = SocketAddr::from(([0, 0, 0, 0], http_port));
            let plain = TcpListener::bind(plain_addr)
                .await
                .context(format!("Failed to bind to {}", plain_addr))?;
            info!("plain http listener on {}", plain_addr);
            tokio::spawn(
                Arc::clone(&self).accept_loop(plain, None, "http", shutdown.clone()),
            );
        }

        self.accept_loop(listener, tls_acceptor, scheme, shutdown)
            .await
    }

    /// TLS identity for the data port, taken from the first TLS-enabled
    /// service
    fn build_tls_acceptor(&self) -> Result<Option<tokio_native_tls::TlsAcceptor>> {
        let registry = self.manager.registry();
        let Some(tls) = registry.services().iter().find_map(|s| s.tls.clone()) else {
            return Ok(None);
        };

        let cert = std::fs::read(&tls.cert_file)
            .context(format!("Failed to read cert file {}", tls.cert_file))?;
        let key = std::fs::read(&tls.key_file)
            .context(format!("Failed to read key file {}", tls.key_file))?;
        let identity = native_tls::Identity::from_pkcs8(&cert, &key)
            .context("Failed to load TLS identity")?;
        let acceptor = native_tls::TlsAcceptor::new(identity)
            .context("Failed to build TLS acceptor")?;
        Ok(Some(tokio_native_tls::TlsAcceptor::from(acceptor)))
    }

    /// Accept until shutdown; each connection gets its own task
    pub async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<tokio_native_tls::TlsAcceptor>,
        scheme: &'static str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        server.serve_connection(stream, remote_addr, tls, scheme).await;
                    });
                }
                _ = shutdown.changed() => {
                    info!("listener draining, no longer accepting connections");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        tls: Option<tokio_native_tls::TlsAcceptor>,
        scheme: &'static str,
    ) {
        self.active.fetch_add(1, Ordering::SeqCst);

        let result = match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    self.serve_http(TokioIo::new(tls_stream), remote_addr, scheme)
                        .await
                }
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", remote_addr, e);
                    Ok(())
                }
            },
            None => self.serve_http(TokioIo::new(stream), remote_addr, scheme).await,
        };

        if let Err(e) = result {
            // Filter out benign connection reset errors
            let err_str = format!("{}", e);
            if !err_str.contains("connection reset") && !err_str.contains("broken pipe") {
                error!("Error serving connection from {}: {}", remote_addr, e);
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drive one connection, speaking HTTP/1.1 or HTTP/2 as the client
    /// prefers, with upgrade support for WebSocket passthrough
    async fn serve_http<I>(
        self: &Arc<Self>,
        io: I,
        remote_addr: SocketAddr,
        scheme: &'static str,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let server = Arc::clone(self);
        let service = service_fn(move |req| {
            let server = Arc::clone(&server);
            async move { server.handle_request(req, remote_addr, scheme).await }
        });

        auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(io, service)
            .await
    }

    /// Number of connections currently in flight
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Block until in-flight connections finish or the deadline passes.
    /// Running out the deadline is not an error; stragglers are dropped
    /// with the process.
    pub async fn wait_for_drain(&self, deadline: Duration) {
        let start = tokio::time::Instant::now();
        while self.active_connections() > 0 && start.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.active_connections();
        if remaining > 0 {
            warn!("shutdown deadline reached with {} connections in flight", remaining);
        }
    }

    /// Route, redirect or forward one request
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        scheme: &'static str,
    ) -> Result<Response<BoxBody>> {
        let request_id: u64 = rand::thread_rng().gen();
        let request_id = format!("{:016x}", request_id);

        let Some(host) = host_of(&req) else {
            debug!(request_id = %request_id, "request without host");
            return self.error_response(StatusCode::NOT_FOUND, "not found");
        };

        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let Some((service, location)) = self.manager.match_route(&host, &path) else {
            debug!(request_id = %request_id, host = %host, path = %path, "no route");
            return self.error_response(StatusCode::NOT_FOUND, "not found");
        };

        debug!(
            request_id = %request_id,
            service = %service.name,
            location = %location.path,
            method = %req.method(),
            path = %path,
            "dispatch"
        );

        // Plain-HTTP hits on an HTTPS-only location bounce to TLS
        if location.http_redirect && scheme == "http" {
            let target = https_redirect_target(&host, &path, query.as_deref());
            return self.redirect_response(StatusCode::PERMANENT_REDIRECT, &target);
        }

        // Client-side path substitution; no backend is contacted
        if let Some(target) = location.redirect_target(&path) {
            let target = match &query {
                Some(q) => format!("{}?{}", target, q),
                None => target,
            };
            return self.redirect_response(StatusCode::MOVED_PERMANENTLY, &target);
        }

        let upstream_path = match &query {
            Some(q) => format!("{}?{}", location.rewrite_path(&path), q),
            None => location.rewrite_path(&path),
        };

        let forwarded_for = self.trusted_forwarded_for(req.headers());
        let mut ctx = RequestContext::new(remote_addr.ip(), forwarded_for);

        if is_websocket_upgrade(req.headers()) {
            return self
                .handle_upgrade(req, &location, &ctx, &upstream_path, remote_addr, scheme, &request_id)
                .await;
        }

        // Buffer the inbound body once so retries can replay it
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(request_id = %request_id, "failed to read request body: {}", e);
                return self.error_response(StatusCode::BAD_REQUEST, "bad request");
            }
        };

        loop {
            let Some(backend) = location.pool.next(&ctx) else {
                warn!(request_id = %request_id, service = %service.name, "no eligible backend");
                return self.error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service temporarily unavailable",
                );
            };
            let guard = SlotGuard::new(Arc::clone(&backend));

            match self
                .forwarder
                .forward(
                    &backend,
                    &parts,
                    body.clone(),
                    &upstream_path,
                    remote_addr.ip(),
                    scheme,
                )
                .await
            {
                Ok(response) => {
                    let (head, incoming) = response.into_parts();
                    let streamed = StreamedBody::new(incoming, guard);
                    return Ok(Response::from_parts(head, streamed.boxed()));
                }
                Err(ProxyError::Upstream(e)) => {
                    backend.set_alive(false);
                    drop(guard);
                    warn!(
                        request_id = %request_id,
                        backend = %backend.url_str(),
                        retries = ctx.retries,
                        error = %e,
                        "upstream error, backend marked down"
                    );
                    if ctx.retries < MAX_RETRIES {
                        ctx.retries += 1;
                        continue;
                    }
                    return self.error_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "service temporarily unavailable",
                    );
                }
                Err(ProxyError::UpstreamProtocol(e)) => {
                    drop(guard);
                    error!(
                        request_id = %request_id,
                        backend = %backend.url_str(),
                        error = %e,
                        "malformed upstream response"
                    );
                    return self.error_response(StatusCode::BAD_GATEWAY, "bad gateway");
                }
                Err(other) => {
                    drop(guard);
                    error!(request_id = %request_id, error = %other, "forward failed");
                    return self.error_response(other.status(), "proxy error");
                }
            }
        }
    }

    /// Forward a WebSocket handshake and splice the upgraded streams
    #[allow(clippy::too_many_arguments)]
    async fn handle_upgrade(
        &self,
        req: Request<Incoming>,
        location: &Location,
        ctx: &RequestContext,
        upstream_path: &str,
        remote_addr: SocketAddr,
        scheme: &'static str,
        request_id: &str,
    ) -> Result<Response<BoxBody>> {
        let Some(backend) = location.pool.next(ctx) else {
            return self.error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "service temporarily unavailable",
            );
        };
        let guard = SlotGuard::new(Arc::clone(&backend));

        match self
            .forwarder
            .forward_upgrade(&backend, req, upstream_path, remote_addr.ip(), scheme, guard)
            .await
        {
            Ok((response, leftover_guard)) => {
                let (head, incoming) = response.into_parts();
                let body = match leftover_guard {
                    Some(guard) => StreamedBody::new(incoming, guard).boxed(),
                    None => incoming.boxed(),
                };
                Ok(Response::from_parts(head, body))
            }
            Err(ProxyError::Upstream(e)) => {
                backend.set_alive(false);
                warn!(
                    request_id = %request_id,
                    backend = %backend.url_str(),
                    error = %e,
                    "websocket upstream error"
                );
                self.error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "service temporarily unavailable",
                )
            }
            Err(other) => {
                error!(request_id = %request_id, error = %other, "websocket forward failed");
                self.error_response(other.status(), "proxy error")
            }
        }
    }

    /// First X-Forwarded-For entry, only when the config trusts it
    fn trusted_forwarded_for(&self, headers: &hyper::HeaderMap) -> Option<String> {
        if !self.manager.config().trust_proxy_headers {
            return None;
        }
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Result<Response<BoxBody>> {
        Ok(Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(string_body(message.to_string()))
            .expect("static error response"))
    }

    fn redirect_response(&self, status: StatusCode, target: &str) -> Result<Response<BoxBody>> {
        Ok(Response::builder()
            .status(status)
            .header(header::LOCATION, target)
            .body(string_body(String::new()))
            .expect("static redirect response"))
    }
}

/// Host header with HTTP/2 authority fallback
fn host_of(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

/// 308 target for http_redirect locations
fn https_redirect_target(host: &str, path: &str, query: Option<&str>) -> String {
    let host = normalize_host(host);
    match query {
        Some(q) => format!("https://{}{}?{}", host, path, q),
        None => format!("https://{}{}", host, path),
    }
}

/// Convert a string into a BoxBody
fn string_body(s: String) -> BoxBody {
    use http_body_util::Full;
    Full::new(Bytes::from(s))
        .map_err(|never| match never {})
        .boxed()
}
