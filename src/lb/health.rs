use super::backend::Backend;
use crate::config::HealthCheckSpec;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One prober task per backend of a pool, plus a shared shutdown signal.
///
/// Probers are independent: a slow probe against one backend never delays
/// the others. State (counters, alive flag) lives on the backend itself so
/// probers can be restarted across reloads without losing hysteresis.
pub struct ProberSet {
    shutdown_tx: watch::Sender<bool>,
    tasks: HashMap<String, JoinHandle<()>>,
}

impl ProberSet {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: HashMap::new(),
        }
    }

    /// Start probers for any backend not yet probed and stop probers whose
    /// backend left the pool
    pub fn sync(&mut self, backends: &[Arc<Backend>]) {
        let wanted: HashMap<&str, &Arc<Backend>> =
            backends.iter().map(|b| (b.url_str(), b)).collect();

        self.tasks.retain(|url, task| {
            if wanted.contains_key(url.as_str()) {
                true
            } else {
                task.abort();
                false
            }
        });

        for (url, backend) in wanted {
            if !self.tasks.contains_key(url) {
                let rx = self.shutdown_tx.subscribe();
                let handle = tokio::spawn(run_prober(Arc::clone(backend), rx));
                self.tasks.insert(url.to_string(), handle);
            }
        }
    }

    pub fn prober_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal all probers to stop at their next suspension point
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.values() {
            task.abort();
        }
        self.tasks.clear();
    }
}

impl Default for ProberSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProberSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_prober(backend: Arc<Backend>, mut shutdown: watch::Receiver<bool>) {
    let spec = backend.health_check().clone();
    let mut ticker = tokio::time::interval(spec.interval_duration());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(
        backend = %backend.url_str(),
        path = %spec.path,
        interval_s = spec.interval,
        "health prober started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                probe_once(&backend, &spec).await;
            }
            _ = shutdown.changed() => {
                debug!(backend = %backend.url_str(), "health prober stopped");
                return;
            }
        }
    }
}

/// Run one probe and fold the result into the backend's hysteresis counters
async fn probe_once(backend: &Backend, spec: &HealthCheckSpec) {
    match probe(backend, spec).await {
        Ok(status) if status.as_u16() < 400 => {
            if backend.probe_success(spec.thresholds.healthy) {
                info!(backend = %backend.url_str(), "backend healthy again");
            }
        }
        Ok(status) => {
            debug!(backend = %backend.url_str(), status = status.as_u16(), "probe failed");
            if backend.probe_failure(spec.thresholds.unhealthy) {
                warn!(
                    backend = %backend.url_str(),
                    status = status.as_u16(),
                    "backend marked unhealthy"
                );
            }
        }
        Err(e) => {
            debug!(backend = %backend.url_str(), error = %e, "probe failed");
            if backend.probe_failure(spec.thresholds.unhealthy) {
                warn!(backend = %backend.url_str(), error = %e, "backend marked unhealthy");
            }
        }
    }
}

/// Issue one HTTP GET against the backend's probe path
async fn probe(
    backend: &Backend,
    spec: &HealthCheckSpec,
) -> Result<StatusCode, Box<dyn std::error::Error + Send + Sync>> {
    let url = backend.url();
    let host = url.host_str().ok_or("backend url missing host")?.to_string();
    let port = url
        .port_or_known_default()
        .ok_or("backend url missing port")?;

    let addr = format!("{}:{}", host, port);
    let timeout = spec.timeout_duration();

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(format!("connect failed: {}", e).into()),
        Err(_) => return Err("connect timeout".into()),
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("probe connection error: {}", e);
        }
    });

    let req = Request::builder()
        .method("GET")
        .uri(spec.path.as_str())
        .header("Host", backend.authority())
        .body(String::new())?;

    let response = match tokio::time::timeout(timeout, sender.send_request(req)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => return Err(format!("request failed: {}", e).into()),
        Err(_) => return Err("request timeout".into()),
    };

    Ok(response.status())
}
