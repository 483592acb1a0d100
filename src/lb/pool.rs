use super::backend::Backend;
use super::policy::Policy;
use super::RequestContext;
use crate::config::{BackendConfig, HealthCheckSpec};
use crate::error::ProxyError;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use url::Url;

/// An ordered set of backends sharing one selection policy.
///
/// The backend list sits behind a read-write lock: request handlers and the
/// admin API read, admin mutations and config reloads write. The lock is
/// never held across an await; `next` hands a snapshot to the policy and
/// returns with no lock held.
pub struct ServerPool {
    backends: RwLock<Vec<Arc<Backend>>>,
    /// Round-robin progression, shared by all requests on this pool
    cursor: AtomicU64,
    policy: RwLock<Policy>,
    default_max_connections: AtomicU32,
}

impl ServerPool {
    pub fn new(policy: Policy, default_max_connections: u32) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            cursor: AtomicU64::new(0),
            policy: RwLock::new(policy),
            default_max_connections: AtomicU32::new(default_max_connections),
        }
    }

    pub fn policy(&self) -> Policy {
        *self.policy.read().expect("pool policy lock poisoned")
    }

    pub fn default_max_connections(&self) -> u32 {
        self.default_max_connections.load(Ordering::Relaxed)
    }

    /// Append a backend built from config
    pub fn add_backend(
        &self,
        cfg: &BackendConfig,
        health_check: HealthCheckSpec,
    ) -> Result<Arc<Backend>, ProxyError> {
        let backend = Arc::new(Backend::from_config(
            cfg,
            self.default_max_connections(),
            health_check,
        )?);
        self.backends
            .write()
            .expect("pool backends lock poisoned")
            .push(Arc::clone(&backend));
        Ok(backend)
    }

    /// Remove the first backend whose canonical URL matches
    pub fn remove_backend(&self, url: &str) -> Result<Arc<Backend>, ProxyError> {
        let target = Url::parse(url)
            .map_err(|source| ProxyError::InvalidUrl {
                url: url.to_string(),
                source,
            })?
            .to_string();

        let mut backends = self.backends.write().expect("pool backends lock poisoned");
        match backends.iter().position(|b| b.url_str() == target) {
            Some(idx) => Ok(backends.remove(idx)),
            None => Err(ProxyError::BackendNotFound(url.to_string())),
        }
    }

    /// Immutable view of the backend list. Clones the Arc handles only,
    /// never backend state.
    pub fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .expect("pool backends lock poisoned")
            .clone()
    }

    /// Select a backend for this request. The returned backend has a
    /// connection slot held; the caller must `release()` it.
    pub fn next(&self, ctx: &RequestContext) -> Option<Arc<Backend>> {
        let snapshot = self.snapshot();
        let policy = self.policy();
        policy.select(&snapshot, &self.cursor, ctx)
    }

    /// Diff the incoming backend list against the current one by URL.
    /// Preserved backends keep connection counts, alive state and smooth
    /// weights; added backends start alive; removed backends are dropped
    /// once their in-flight requests release them.
    ///
    /// Every URL is parsed before anything is mutated so a bad entry
    /// leaves the pool untouched.
    pub fn update_backends<F>(
        &self,
        cfgs: &[BackendConfig],
        resolve_health: F,
    ) -> Result<(), ProxyError>
    where
        F: Fn(&BackendConfig) -> HealthCheckSpec,
    {
        let mut parsed: Vec<(String, &BackendConfig)> = Vec::with_capacity(cfgs.len());
        for cfg in cfgs {
            let url = Url::parse(&cfg.url).map_err(|source| ProxyError::InvalidUrl {
                url: cfg.url.clone(),
                source,
            })?;
            parsed.push((url.to_string(), cfg));
        }

        let mut backends = self.backends.write().expect("pool backends lock poisoned");
        let mut next = Vec::with_capacity(parsed.len());
        for (url_str, cfg) in parsed {
            match backends.iter().find(|b| b.url_str() == url_str) {
                Some(existing) => {
                    existing.set_weight(cfg.weight);
                    next.push(Arc::clone(existing));
                }
                None => {
                    next.push(Arc::new(Backend::from_config(
                        cfg,
                        self.default_max_connections(),
                        resolve_health(cfg),
                    )?));
                }
            }
        }
        *backends = next;
        Ok(())
    }

    /// Swap policy and pool-default cap, e.g. on reload
    pub fn update_config(&self, policy: Policy, default_max_connections: u32) {
        *self.policy.write().expect("pool policy lock poisoned") = policy;
        self.default_max_connections
            .store(default_max_connections, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn backend_cfg(url: &str) -> BackendConfig {
        BackendConfig {
            url: url.to_string(),
            weight: 1,
            max_connections: 0,
            health_check: None,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("127.0.0.1".parse::<IpAddr>().unwrap(), None)
    }

    #[test]
    fn test_add_and_remove() {
        let pool = ServerPool::new(Policy::RoundRobin, 100);
        pool.add_backend(&backend_cfg("http://b1:80"), HealthCheckSpec::default())
            .unwrap();
        pool.add_backend(&backend_cfg("http://b2:80"), HealthCheckSpec::default())
            .unwrap();
        assert_eq!(pool.snapshot().len(), 2);

        pool.remove_backend("http://b1:80").unwrap();
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].url_str(), "http://b2/");
    }

    #[test]
    fn test_remove_missing() {
        let pool = ServerPool::new(Policy::RoundRobin, 100);
        assert!(matches!(
            pool.remove_backend("http://nope:80"),
            Err(ProxyError::BackendNotFound(_))
        ));
    }

    #[test]
    fn test_next_on_empty_pool() {
        let pool = ServerPool::new(Policy::RoundRobin, 100);
        assert!(pool.next(&ctx()).is_none());
    }

    #[test]
    fn test_next_releases_nothing_on_dead_pool() {
        let pool = ServerPool::new(Policy::RoundRobin, 100);
        let backend = pool
            .add_backend(&backend_cfg("http://b1:80"), HealthCheckSpec::default())
            .unwrap();
        backend.set_alive(false);
        assert!(pool.next(&ctx()).is_none());
        assert_eq!(backend.connection_count(), 0);
    }

    #[test]
    fn test_update_preserves_live_state() {
        let pool = ServerPool::new(Policy::RoundRobin, 100);
        let b1 = pool
            .add_backend(&backend_cfg("http://b1:80"), HealthCheckSpec::default())
            .unwrap();
        pool.add_backend(&backend_cfg("http://b2:80"), HealthCheckSpec::default())
            .unwrap();

        assert!(b1.try_acquire());
        b1.set_alive(false);

        // b2 removed, b3 added, b1 kept with a new weight
        let mut kept = backend_cfg("http://b1:80");
        kept.weight = 7;
        pool.update_backends(&[kept, backend_cfg("http://b3:80")], |_| {
            HealthCheckSpec::default()
        })
        .unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(Arc::ptr_eq(&snapshot[0], &b1));
        assert_eq!(snapshot[0].connection_count(), 1);
        assert!(!snapshot[0].is_alive());
        assert_eq!(snapshot[0].weight(), 7);
        assert!(snapshot[1].is_alive());
    }

    #[test]
    fn test_update_same_config_is_noop_on_identity() {
        let pool = ServerPool::new(Policy::RoundRobin, 100);
        let b1 = pool
            .add_backend(&backend_cfg("http://b1:80"), HealthCheckSpec::default())
            .unwrap();
        assert!(b1.try_acquire());

        pool.update_backends(&[backend_cfg("http://b1:80")], |_| {
            HealthCheckSpec::default()
        })
        .unwrap();
        pool.update_backends(&[backend_cfg("http://b1:80")], |_| {
            HealthCheckSpec::default()
        })
        .unwrap();

        let snapshot = pool.snapshot();
        assert!(Arc::ptr_eq(&snapshot[0], &b1));
        assert_eq!(snapshot[0].connection_count(), 1);
    }

    #[test]
    fn test_update_rejects_bad_url_without_mutation() {
        let pool = ServerPool::new(Policy::RoundRobin, 100);
        pool.add_backend(&backend_cfg("http://b1:80"), HealthCheckSpec::default())
            .unwrap();

        let result = pool.update_backends(
            &[backend_cfg("http://ok:80"), backend_cfg("://bad")],
            |_| HealthCheckSpec::default(),
        );
        assert!(result.is_err());
        assert_eq!(pool.snapshot()[0].url_str(), "http://b1/");
    }

    #[test]
    fn test_removed_backend_survives_via_inflight_handle() {
        let pool = ServerPool::new(Policy::RoundRobin, 100);
        let b1 = pool
            .add_backend(&backend_cfg("http://b1:80"), HealthCheckSpec::default())
            .unwrap();
        assert!(b1.try_acquire());

        pool.remove_backend("http://b1:80").unwrap();
        assert!(pool.snapshot().is_empty());

        // The in-flight handle still works and settles cleanly
        assert_eq!(b1.connection_count(), 1);
        b1.release();
        assert_eq!(b1.connection_count(), 0);
    }
}
