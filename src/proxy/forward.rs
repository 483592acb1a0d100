use crate::config::ConnectionPoolConfig;
use crate::error::ProxyError;
use crate::lb::Backend;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use native_tls::TlsConnector;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Headers that belong to a single hop and must not cross the proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// A connection slot held on a backend for the lifetime of one forward.
/// Releasing is tied to Drop so cancelled or failed forwards can never
/// leak a slot; latency is recorded only when the response body ran to
/// completion.
pub struct SlotGuard {
    backend: Arc<Backend>,
    start: Instant,
    completed: bool,
}

impl SlotGuard {
    /// Wrap a slot already reserved by `try_acquire`
    pub fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            start: Instant::now(),
            completed: false,
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.completed {
            self.backend.record_latency(self.start.elapsed());
        }
        self.backend.release();
    }
}

/// Upstream response body that releases its backend slot once fully
/// streamed to the client
pub struct StreamedBody {
    inner: Incoming,
    guard: Option<SlotGuard>,
}

impl StreamedBody {
    pub fn new(inner: Incoming, guard: SlotGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl Body for StreamedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                if let Some(mut guard) = this.guard.take() {
                    guard.complete();
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                // Truncated upstream body: release without recording
                this.guard.take();
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

/// True when the request asks for a WebSocket protocol upgrade
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    let is_websocket = headers
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    wants_upgrade && is_websocket
}

/// Copy headers across the proxy, dropping hop-by-hop ones. Upgrade
/// requests keep Connection and Upgrade so the handshake survives.
fn copy_headers(from: &HeaderMap, to: &mut HeaderMap, keep_upgrade: bool) {
    for (name, value) in from {
        let lower = name.as_str();
        if lower == "host" {
            continue;
        }
        if HOP_BY_HOP.contains(&lower) {
            if keep_upgrade && (lower == "connection" || lower == "upgrade") {
                to.insert(name.clone(), value.clone());
            }
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Drop hop-by-hop headers from an upstream response, except on a 101
/// where the upgrade handshake must pass through
pub fn sanitize_response_headers(response: &mut Response<Incoming>) {
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        return;
    }
    let headers = response.headers_mut();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Append the client address to X-Forwarded-For and stamp
/// X-Forwarded-Proto with the inbound scheme
fn set_forwarded_headers(
    headers: &mut HeaderMap,
    inbound: &HeaderMap,
    client_ip: IpAddr,
    scheme: &str,
) {
    let forwarded_for = match inbound
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    if let Ok(value) = HeaderValue::from_str(scheme) {
        headers.insert(HeaderName::from_static("x-forwarded-proto"), value);
    }
}

/// Shared upstream HTTP engine. One instance serves every backend; the
/// underlying hyper client keeps a per-host idle pool sized from the
/// connection_pool config.
pub struct Forwarder {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl Forwarder {
    pub fn new(pool: &ConnectionPoolConfig) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = TlsConnector::new().context("building upstream TLS connector")?;
        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(pool.idle_timeout))
            .pool_max_idle_per_host(pool.max_idle)
            .set_host(true)
            .build(https);

        Ok(Self { client })
    }

    /// Absolute upstream URI: backend origin, optional backend base path,
    /// then the (possibly rewritten) request path and query
    fn upstream_uri(backend: &Backend, path_and_query: &str) -> String {
        let mut uri = format!("{}://{}", backend.scheme(), backend.authority());
        let base = backend.url().path();
        if base != "/" {
            uri.push_str(base.trim_end_matches('/'));
        }
        uri.push_str(path_and_query);
        uri
    }

    /// Forward one buffered request to a backend and hand back the raw
    /// upstream response. Transport failures come back as retryable
    /// errors; malformed responses as protocol errors.
    pub async fn forward(
        &self,
        backend: &Backend,
        inbound: &Parts,
        body: Bytes,
        path_and_query: &str,
        client_ip: IpAddr,
        scheme: &str,
    ) -> Result<Response<Incoming>, ProxyError> {
        let uri = Self::upstream_uri(backend, path_and_query);

        let mut builder = Request::builder()
            .method(inbound.method.clone())
            .uri(uri.as_str());
        if let Some(headers) = builder.headers_mut() {
            copy_headers(&inbound.headers, headers, false);
            set_forwarded_headers(headers, &inbound.headers, client_ip, scheme);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))?;

        debug!(backend = %backend.url_str(), uri = %uri, "forwarding");
        let mut response = self
            .client
            .request(request)
            .await
            .map_err(classify_upstream_error)?;
        sanitize_response_headers(&mut response);
        Ok(response)
    }

    /// Proxy a WebSocket upgrade: forward the handshake, then splice both
    /// upgraded connections together in a background task. The slot guard
    /// rides along and releases when the tunnel closes.
    pub async fn forward_upgrade(
        &self,
        backend: &Backend,
        mut inbound: Request<Incoming>,
        path_and_query: &str,
        client_ip: IpAddr,
        scheme: &str,
        guard: SlotGuard,
    ) -> Result<(Response<Incoming>, Option<SlotGuard>), ProxyError> {
        let uri = Self::upstream_uri(backend, path_and_query);

        let mut builder = Request::builder()
            .method(inbound.method().clone())
            .uri(uri.as_str());
        if let Some(headers) = builder.headers_mut() {
            copy_headers(inbound.headers(), headers, true);
            set_forwarded_headers(headers, inbound.headers(), client_ip, scheme);
        }
        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))?;

        let client_upgrade = hyper::upgrade::on(&mut inbound);

        let mut response = self
            .client
            .request(request)
            .await
            .map_err(classify_upstream_error)?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            // Upstream declined the upgrade; hand the guard back so the
            // caller ties it to the response body
            sanitize_response_headers(&mut response);
            return Ok((response, Some(guard)));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let backend_url = backend.url_str().to_string();
        tokio::spawn(async move {
            let _guard = guard;
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client_io, upstream_io)) => {
                    let mut client_io = TokioIo::new(client_io);
                    let mut upstream_io = TokioIo::new(upstream_io);
                    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                        Ok((up, down)) => debug!(
                            backend = %backend_url,
                            bytes_up = up,
                            bytes_down = down,
                            "websocket tunnel closed"
                        ),
                        Err(e) => {
                            debug!(backend = %backend_url, error = %e, "websocket tunnel error")
                        }
                    }
                }
                Err(e) => warn!(backend = %backend_url, error = %e, "websocket upgrade failed"),
            }
        });

        Ok((response, None))
    }
}

/// Transport-level errors are retryable; parse failures mean the upstream
/// spoke garbage and must not be retried
fn classify_upstream_error(err: hyper_util::client::legacy::Error) -> ProxyError {
    if err.is_connect() {
        return ProxyError::Upstream(err);
    }
    let is_parse = std::error::Error::source(&err)
        .and_then(|s| s.downcast_ref::<hyper::Error>())
        .map(hyper::Error::is_parse)
        .unwrap_or(false);
    if is_parse {
        ProxyError::UpstreamProtocol(err.to_string())
    } else {
        ProxyError::Upstream(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, HealthCheckSpec};

    fn backend(url: &str) -> Backend {
        Backend::from_config(
            &BackendConfig {
                url: url.to_string(),
                weight: 1,
                max_connections: 0,
                health_check: None,
            },
            100,
            HealthCheckSpec::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_upstream_uri() {
        let b = backend("http://10.0.0.1:8081");
        assert_eq!(
            Forwarder::upstream_uri(&b, "/v2/users?limit=5"),
            "http://10.0.0.1:8081/v2/users?limit=5"
        );

        let with_base = backend("http://10.0.0.1:8081/base/");
        assert_eq!(
            Forwarder::upstream_uri(&with_base, "/users"),
            "http://10.0.0.1:8081/base/users"
        );
    }

    #[test]
    fn test_copy_headers_strips_hop_by_hop() {
        let mut from = HeaderMap::new();
        from.insert("connection", HeaderValue::from_static("keep-alive"));
        from.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        from.insert("te", HeaderValue::from_static("trailers"));
        from.insert("host", HeaderValue::from_static("a.test"));
        from.insert("x-request-id", HeaderValue::from_static("abc"));

        let mut to = HeaderMap::new();
        copy_headers(&from, &mut to, false);

        assert!(to.get("connection").is_none());
        assert!(to.get("transfer-encoding").is_none());
        assert!(to.get("te").is_none());
        assert!(to.get("host").is_none());
        assert_eq!(to.get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn test_copy_headers_keeps_upgrade_pair_for_websocket() {
        let mut from = HeaderMap::new();
        from.insert("connection", HeaderValue::from_static("Upgrade"));
        from.insert("upgrade", HeaderValue::from_static("websocket"));
        from.insert("sec-websocket-key", HeaderValue::from_static("k"));

        let mut to = HeaderMap::new();
        copy_headers(&from, &mut to, true);

        assert_eq!(to.get("connection").unwrap(), "Upgrade");
        assert_eq!(to.get("upgrade").unwrap(), "websocket");
        assert_eq!(to.get("sec-websocket-key").unwrap(), "k");
    }

    #[test]
    fn test_forwarded_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));

        let mut out = HeaderMap::new();
        set_forwarded_headers(&mut out, &inbound, "10.0.0.7".parse().unwrap(), "https");

        assert_eq!(out.get("x-forwarded-for").unwrap(), "203.0.113.9, 10.0.0.7");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn test_forwarded_headers_without_existing_chain() {
        let inbound = HeaderMap::new();
        let mut out = HeaderMap::new();
        set_forwarded_headers(&mut out, &inbound, "10.0.0.7".parse().unwrap(), "http");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "10.0.0.7");
    }

    #[test]
    fn test_is_websocket_upgrade() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));

        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert("upgrade", HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn test_slot_guard_releases_on_drop() {
        let b = Arc::new(backend("http://10.0.0.1:8081"));
        assert!(b.try_acquire());
        {
            let _guard = SlotGuard::new(Arc::clone(&b));
            assert_eq!(b.connection_count(), 1);
        }
        assert_eq!(b.connection_count(), 0);
        // Not completed, so no latency sample was recorded
        assert_eq!(b.ewma_micros(), 0);
    }

    #[test]
    fn test_slot_guard_records_latency_on_completion() {
        let b = Arc::new(backend("http://10.0.0.1:8081"));
        assert!(b.try_acquire());
        {
            let mut guard = SlotGuard::new(Arc::clone(&b));
            std::thread::sleep(std::time::Duration::from_millis(2));
            guard.complete();
        }
        assert_eq!(b.connection_count(), 0);
        assert!(b.ewma_micros() > 0);
    }
}
