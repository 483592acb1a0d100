use crate::config::BackendConfig;
use crate::error::ProxyError;
use crate::service::ServiceManager;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Read-only view of one backend's live state
#[derive(Debug, Serialize)]
struct BackendView {
    url: String,
    alive: bool,
    connections: u32,
    weight: u32,
    max_connections: u32,
    response_time_ms: u64,
}

#[derive(Debug, Serialize)]
struct LocationView {
    path: String,
    lb_policy: &'static str,
    backends_count: usize,
}

#[derive(Debug, Serialize)]
struct ServiceView {
    name: String,
    host: String,
    tls: bool,
    locations: Vec<LocationView>,
}

#[derive(Debug, Serialize)]
struct BackendHealthView {
    alive: bool,
    connections: u32,
}

#[derive(Debug, Serialize)]
struct ServiceStats {
    total_backends: usize,
    active_backends: usize,
    total_connections: u32,
}

/// Administrative REST API on the admin port: inspect services, locations
/// and backend health, add or remove backends at runtime.
pub struct AdminApi {
    manager: Arc<ServiceManager>,
}

impl AdminApi {
    pub fn new(manager: Arc<ServiceManager>) -> Self {
        Self { manager }
    }

    pub async fn run(
        self: Arc<Self>,
        port: u16,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind admin listener to {}", addr))?;
        info!("admin api listening on {}", addr);
        self.run_with_listener(listener, shutdown).await
    }

    pub async fn run_with_listener(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("admin accept failed: {}", e);
                            continue;
                        }
                    };
                    let api = Arc::clone(&self);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let api = Arc::clone(&api);
                            async move { api.handle(req).await }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            let err_str = format!("{}", e);
                            if !err_str.contains("connection reset") {
                                error!("admin connection from {} failed: {}", remote_addr, e);
                            }
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("admin api shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Result<Response<BoxBody>> {
        let path = req.uri().path().to_string();
        let query = parse_query(req.uri().query());

        match path.as_str() {
            "/api/services" => self.handle_services(&req, &query),
            "/api/locations" => self.handle_locations(&req, &query),
            "/api/backends" => self.handle_backends(req, query).await,
            "/api/health" => self.handle_health(&req),
            "/api/stats" => self.handle_stats(&req),
            "/api/config" => self.handle_config(&req),
            _ => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    fn handle_services(
        &self,
        req: &Request<Incoming>,
        query: &HashMap<String, String>,
    ) -> Result<Response<BoxBody>> {
        if req.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let registry = self.manager.registry();
        if let Some(name) = query.get("service_name") {
            let Some(service) = registry.get_service(name) else {
                return error_response(StatusCode::NOT_FOUND, "service not found");
            };
            return json_response(StatusCode::OK, &service_view(service.as_ref()));
        }

        let services: Vec<ServiceView> = registry
            .services()
            .iter()
            .map(|s| service_view(s.as_ref()))
            .collect();
        json_response(StatusCode::OK, &services)
    }

    fn handle_locations(
        &self,
        req: &Request<Incoming>,
        query: &HashMap<String, String>,
    ) -> Result<Response<BoxBody>> {
        if req.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        let Some(name) = query.get("service_name") else {
            return error_response(StatusCode::BAD_REQUEST, "service_name is required");
        };
        let Some(service) = self.manager.registry().get_service(name) else {
            return error_response(StatusCode::NOT_FOUND, "service not found");
        };

        let locations: Vec<LocationView> = service
            .locations
            .iter()
            .map(|l| LocationView {
                path: l.path.clone(),
                lb_policy: l.pool.policy().name(),
                backends_count: l.pool.snapshot().len(),
            })
            .collect();
        json_response(StatusCode::OK, &locations)
    }

    async fn handle_backends(
        &self,
        req: Request<Incoming>,
        query: HashMap<String, String>,
    ) -> Result<Response<BoxBody>> {
        let Some(service_name) = query.get("service_name").cloned() else {
            return error_response(StatusCode::BAD_REQUEST, "service_name is required");
        };
        let path = query.get("path").cloned();

        let method = req.method().clone();
        match method {
            Method::GET => {
                let (_, location) =
                    match self.manager.locate(&service_name, path.as_deref()) {
                        Ok(found) => found,
                        Err(e) => return admin_error(&e),
                    };
                let backends: Vec<BackendView> = location
                    .pool
                    .snapshot()
                    .iter()
                    .map(|b| BackendView {
                        url: b.url_str().to_string(),
                        alive: b.is_alive(),
                        connections: b.connection_count(),
                        weight: b.weight(),
                        max_connections: b.max_connections(),
                        response_time_ms: b.ewma_micros() / 1000,
                    })
                    .collect();
                json_response(StatusCode::OK, &backends)
            }
            Method::POST => {
                let body = match collect_body(req).await {
                    Ok(body) => body,
                    Err(resp) => return resp,
                };
                let cfg: BackendConfig = match serde_json::from_slice(&body) {
                    Ok(cfg) => cfg,
                    Err(e) => {
                        return error_response(StatusCode::BAD_REQUEST, &e.to_string())
                    }
                };
                match self
                    .manager
                    .add_backend(&service_name, path.as_deref(), &cfg)
                {
                    Ok(()) => status_response(StatusCode::CREATED),
                    Err(e) => admin_error(&e),
                }
            }
            Method::DELETE => {
                let body = match collect_body(req).await {
                    Ok(body) => body,
                    Err(resp) => return resp,
                };
                #[derive(serde::Deserialize)]
                struct RemoveRequest {
                    url: String,
                }
                let remove: RemoveRequest = match serde_json::from_slice(&body) {
                    Ok(r) => r,
                    Err(e) => {
                        return error_response(StatusCode::BAD_REQUEST, &e.to_string())
                    }
                };
                match self
                    .manager
                    .remove_backend(&service_name, path.as_deref(), &remove.url)
                {
                    Ok(()) => status_response(StatusCode::NO_CONTENT),
                    Err(e) => admin_error(&e),
                }
            }
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }

    fn handle_health(&self, req: &Request<Incoming>) -> Result<Response<BoxBody>> {
        if req.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let registry = self.manager.registry();
        let mut health: HashMap<String, HashMap<String, BackendHealthView>> = HashMap::new();
        for service in registry.services() {
            let entry = health.entry(service.name.clone()).or_default();
            for location in &service.locations {
                for backend in location.pool.snapshot() {
                    entry.insert(
                        backend.url_str().to_string(),
                        BackendHealthView {
                            alive: backend.is_alive(),
                            connections: backend.connection_count(),
                        },
                    );
                }
            }
        }
        json_response(StatusCode::OK, &health)
    }

    fn handle_stats(&self, req: &Request<Incoming>) -> Result<Response<BoxBody>> {
        if req.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let registry = self.manager.registry();
        let mut stats: HashMap<String, ServiceStats> = HashMap::new();
        for service in registry.services() {
            let mut total = 0;
            let mut active = 0;
            let mut connections = 0;
            for location in &service.locations {
                for backend in location.pool.snapshot() {
                    total += 1;
                    if backend.is_alive() {
                        active += 1;
                    }
                    connections += backend.connection_count();
                }
            }
            stats.insert(
                service.name.clone(),
                ServiceStats {
                    total_backends: total,
                    active_backends: active,
                    total_connections: connections,
                },
            );
        }
        json_response(StatusCode::OK, &stats)
    }

    fn handle_config(&self, req: &Request<Incoming>) -> Result<Response<BoxBody>> {
        if req.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        json_response(StatusCode::OK, self.manager.config().as_ref())
    }
}

fn service_view(service: &crate::service::Service) -> ServiceView {
    ServiceView {
        name: service.name.clone(),
        host: service.host.clone(),
        tls: service.tls.is_some(),
        locations: service
            .locations
            .iter()
            .map(|l| LocationView {
                path: l.path.clone(),
                lb_policy: l.pool.policy().name(),
                backends_count: l.pool.snapshot().len(),
            })
            .collect(),
    }
}

/// Map core errors onto admin API status codes. The ambiguous-location
/// case (no path given, several locations) is a client error.
fn admin_error(err: &ProxyError) -> Result<Response<BoxBody>> {
    let status = match err {
        ProxyError::AmbiguousLocation | ProxyError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
        ProxyError::ServiceNotFound(_)
        | ProxyError::LocationNotFound(_)
        | ProxyError::BackendNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

async fn collect_body(
    req: Request<Incoming>,
) -> std::result::Result<Bytes, Result<Response<BoxBody>>> {
    match req.into_body().collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(error_response(
            StatusCode::BAD_REQUEST,
            &format!("failed to read body: {}", e),
        )),
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<BoxBody>> {
    let body = serde_json::to_vec(value).context("serializing admin response")?;
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(bytes_body(Bytes::from(body)))
        .expect("static admin response"))
}

fn status_response(status: StatusCode) -> Result<Response<BoxBody>> {
    Ok(Response::builder()
        .status(status)
        .body(bytes_body(Bytes::new()))
        .expect("static admin response"))
}

fn error_response(status: StatusCode, message: &str) -> Result<Response<BoxBody>> {
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(bytes_body(Bytes::from(message.to_string())))
        .expect("static admin response"))
}

fn bytes_body(b: Bytes) -> BoxBody {
    Full::new(b).map_err(|never| match never {}).boxed()
}
