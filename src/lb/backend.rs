use crate::config::{BackendConfig, HealthCheckSpec};
use crate::error::ProxyError;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use url::Url;

/// EWMA smoothing factor for observed upstream latency
const EWMA_ALPHA: f64 = 0.2;

/// A single upstream server with connection and health tracking.
///
/// Identity (URL, weight, connection cap) is fixed at construction; the
/// counters are atomics so request handlers, probers and the admin API can
/// touch them without a lock. The alive flag is only written by the prober's
/// hysteresis logic and by the dispatcher on a forward error.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    url_str: String,
    /// Read-mostly; written only under the pool's write lock during
    /// reconfiguration
    weight: AtomicU32,
    max_connections: u32,
    health_check: HealthCheckSpec,

    alive: AtomicBool,
    connections: AtomicU32,
    /// Working weight for smooth weighted round-robin
    current_weight: AtomicI64,
    /// EWMA of upstream latency in microseconds; 0 until first observation
    ewma_micros: AtomicU64,

    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl Backend {
    /// Build a backend from config. `pool_max_connections` is the location
    /// default used when the backend's own cap is 0.
    pub fn from_config(
        cfg: &BackendConfig,
        pool_max_connections: u32,
        health_check: HealthCheckSpec,
    ) -> Result<Self, ProxyError> {
        let url = Url::parse(&cfg.url).map_err(|source| ProxyError::InvalidUrl {
            url: cfg.url.clone(),
            source,
        })?;
        if url.host_str().is_none() {
            return Err(ProxyError::InvalidUrl {
                url: cfg.url.clone(),
                source: url::ParseError::EmptyHost,
            });
        }

        let max_connections = if cfg.max_connections == 0 {
            pool_max_connections
        } else {
            cfg.max_connections
        };

        let url_str = url.to_string();
        Ok(Self {
            url,
            url_str,
            weight: AtomicU32::new(cfg.weight.max(1)),
            max_connections,
            health_check,
            alive: AtomicBool::new(true),
            connections: AtomicU32::new(0),
            current_weight: AtomicI64::new(0),
            ewma_micros: AtomicU64::new(0),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Canonical URL string, the identity used by add/remove and reload diffs
    pub fn url_str(&self) -> &str {
        &self.url_str
    }

    /// Host header value for upstream requests
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub(crate) fn set_weight(&self, weight: u32) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn health_check(&self) -> &HealthCheckSpec {
        &self.health_check
    }

    /// Reserve a connection slot. Increments the counter iff the
    /// post-increment value stays within the cap; never blocks and never
    /// oversubscribes under concurrent callers.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.connections.load(Ordering::Acquire);
        loop {
            if current >= self.max_connections {
                return false;
            }
            match self.connections.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a slot taken by a successful `try_acquire`
    pub fn release(&self) {
        let prev = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            })
            .unwrap_or(0);
        debug_assert!(prev > 0, "release() without a matching try_acquire()");
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Record one observed upstream latency into the EWMA
    pub fn record_latency(&self, latency: std::time::Duration) {
        let sample = latency.as_micros() as u64;
        let current = self.ewma_micros.load(Ordering::Acquire);
        let next = if current == 0 {
            sample
        } else {
            (EWMA_ALPHA * sample as f64 + (1.0 - EWMA_ALPHA) * current as f64) as u64
        };
        self.ewma_micros.store(next, Ordering::Release);
    }

    pub fn ewma_micros(&self) -> u64 {
        self.ewma_micros.load(Ordering::Acquire)
    }

    pub(crate) fn current_weight(&self) -> &AtomicI64 {
        &self.current_weight
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Apply one successful probe. Returns true when the backend just
    /// transitioned to alive.
    pub fn probe_success(&self, healthy_threshold: u32) -> bool {
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        self.consecutive_failures.store(0, Ordering::Release);
        if !self.is_alive() && successes >= healthy_threshold {
            self.set_alive(true);
            return true;
        }
        false
    }

    /// Apply one failed probe. Returns true when the backend just
    /// transitioned to not-alive.
    pub fn probe_failure(&self, unhealthy_threshold: u32) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.consecutive_successes.store(0, Ordering::Release);
        if self.is_alive() && failures >= unhealthy_threshold {
            self.set_alive(false);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn backend(max_connections: u32) -> Backend {
        Backend::from_config(
            &BackendConfig {
                url: "http://10.0.0.1:8081".to_string(),
                weight: 1,
                max_connections,
                health_check: None,
            },
            1000,
            HealthCheckSpec::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_initial_state() {
        let b = backend(2);
        assert!(b.is_alive());
        assert_eq!(b.connection_count(), 0);
        assert_eq!(b.consecutive_successes(), 0);
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.ewma_micros(), 0);
    }

    #[test]
    fn test_capacity_gate() {
        let b = backend(2);
        assert!(b.try_acquire());
        assert!(b.try_acquire());
        assert!(!b.try_acquire());
        assert_eq!(b.connection_count(), 2);

        b.release();
        assert!(b.try_acquire());
        assert_eq!(b.connection_count(), 2);
    }

    #[test]
    fn test_inherits_pool_cap() {
        let b = backend(0);
        assert_eq!(b.max_connections(), 1000);
    }

    #[test]
    fn test_concurrent_acquire_never_oversubscribes() {
        let b = Arc::new(backend(50));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = Arc::clone(&b);
            handles.push(std::thread::spawn(move || {
                let mut acquired = 0u32;
                for _ in 0..100 {
                    if b.try_acquire() {
                        acquired += 1;
                    }
                }
                acquired
            }));
        }
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(b.connection_count(), 50);
    }

    #[test]
    fn test_ewma() {
        let b = backend(2);
        b.record_latency(Duration::from_millis(100));
        assert_eq!(b.ewma_micros(), 100_000);

        // 0.2 * 200ms + 0.8 * 100ms = 120ms
        b.record_latency(Duration::from_millis(200));
        assert_eq!(b.ewma_micros(), 120_000);
    }

    #[test]
    fn test_hysteresis_down_and_up() {
        let b = backend(2);

        assert!(!b.probe_failure(3));
        assert!(!b.probe_failure(3));
        assert!(b.is_alive());
        assert!(b.probe_failure(3));
        assert!(!b.is_alive());

        assert!(!b.probe_success(2));
        assert!(b.probe_success(2));
        assert!(b.is_alive());
    }

    #[test]
    fn test_alternating_probes_never_flip_state() {
        let b = backend(2);
        for _ in 0..20 {
            b.probe_success(2);
            b.probe_failure(3);
            assert!(b.is_alive());
        }
    }

    #[test]
    fn test_authority() {
        let b = backend(2);
        assert_eq!(b.authority(), "10.0.0.1:8081");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = Backend::from_config(
            &BackendConfig {
                url: "://bad".to_string(),
                weight: 1,
                max_connections: 0,
                health_check: None,
            },
            100,
            HealthCheckSpec::default(),
        );
        assert!(result.is_err());
    }
}
