use crate::config::{BackendConfig, Config, RedirectConfig, TlsConfig};
use crate::error::ProxyError;
use crate::lb::{Backend, Policy, ProberSet, ServerPool};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// A path-prefix routing entry owning exactly one backend pool
pub struct Location {
    /// Normalized prefix; the empty string is stored as "/" and both act
    /// as the catch-all
    pub path: String,
    pub rewrite: Option<String>,
    pub redirect: Option<RedirectConfig>,
    pub http_redirect: bool,
    pub pool: Arc<ServerPool>,
}

impl Location {
    /// Prefix-match against a request path. Returns the match length used
    /// for longest-prefix ranking; the catch-all matches everything at
    /// rank zero.
    pub fn match_len(&self, request_path: &str) -> Option<usize> {
        if self.path == "/" {
            return Some(0);
        }
        if request_path.starts_with(&self.path) {
            return Some(self.path.len());
        }
        None
    }

    /// Upstream-bound path: the location prefix replaced by the rewrite
    /// value, untouched when no rewrite is configured
    pub fn rewrite_path(&self, request_path: &str) -> String {
        let Some(rewrite) = &self.rewrite else {
            return request_path.to_string();
        };
        let remainder = if self.path == "/" {
            request_path.strip_prefix('/').unwrap_or(request_path)
        } else {
            request_path
                .strip_prefix(self.path.as_str())
                .unwrap_or(request_path)
        };
        if rewrite.ends_with('/') {
            format!("{}{}", rewrite, remainder.trim_start_matches('/'))
        } else if remainder.is_empty() || remainder.starts_with('/') {
            format!("{}{}", rewrite, remainder)
        } else {
            format!("{}/{}", rewrite, remainder)
        }
    }

    /// Client-side redirect target, if this request matches the
    /// redirect's "from" prefix
    pub fn redirect_target(&self, request_path: &str) -> Option<String> {
        let redirect = self.redirect.as_ref()?;
        if request_path.starts_with(&redirect.from) {
            Some(request_path.replacen(&redirect.from, &redirect.to, 1))
        } else {
            None
        }
    }
}

/// A virtual-host-scoped container of locations
pub struct Service {
    pub name: String,
    /// Lowercased virtual host
    pub host: String,
    pub tls: Option<TlsConfig>,
    pub locations: Vec<Arc<Location>>,
}

/// Immutable routing table: services by name plus a host index. Replaced
/// wholesale on reload; readers hold an Arc and never observe a torn
/// update.
pub struct Registry {
    order: Vec<Arc<Service>>,
    by_name: HashMap<String, Arc<Service>>,
    by_host: HashMap<String, Vec<Arc<Service>>>,
}

/// Strip any port and case-fold a Host header value
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    // IPv6 literals keep their brackets; everything else loses the port
    let stripped = if let Some(end) = host.strip_prefix('[').and_then(|h| h.find(']')) {
        &host[..end + 2]
    } else {
        host.rsplit_once(':')
            .map(|(h, _)| h)
            .filter(|h| !h.is_empty())
            .unwrap_or(host)
    };
    stripped.to_ascii_lowercase()
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

impl Registry {
    /// Build a registry from config, reusing pools from `previous` where
    /// the (service name, location path) identity matches so connection
    /// counts and alive state survive the reload.
    fn build(config: &Config, previous: Option<&Registry>) -> Result<Self, ProxyError> {
        let mut order = Vec::with_capacity(config.services.len());
        let mut by_name = HashMap::new();
        let mut by_host: HashMap<String, Vec<Arc<Service>>> = HashMap::new();

        for service_cfg in &config.services {
            let mut locations = Vec::with_capacity(service_cfg.locations.len());
            for location_cfg in &service_cfg.locations {
                let path = normalize_path(&location_cfg.path);
                let policy = Policy::parse(&location_cfg.lb_policy)?;

                let reused = previous
                    .and_then(|r| r.by_name.get(&service_cfg.name))
                    .and_then(|s| s.locations.iter().find(|l| l.path == path))
                    .map(|l| Arc::clone(&l.pool));

                let pool = match reused {
                    Some(pool) => {
                        pool.update_config(policy, location_cfg.max_connections);
                        pool.update_backends(&location_cfg.backends, |b| {
                            config.resolve_health_check(service_cfg, b)
                        })?;
                        pool
                    }
                    None => {
                        let pool =
                            Arc::new(ServerPool::new(policy, location_cfg.max_connections));
                        for backend_cfg in &location_cfg.backends {
                            pool.add_backend(
                                backend_cfg,
                                config.resolve_health_check(service_cfg, backend_cfg),
                            )?;
                        }
                        pool
                    }
                };

                locations.push(Arc::new(Location {
                    path,
                    rewrite: location_cfg.rewrite.clone(),
                    redirect: location_cfg.redirect.clone(),
                    http_redirect: location_cfg.http_redirect,
                    pool,
                }));
            }

            let service = Arc::new(Service {
                name: service_cfg.name.clone(),
                host: normalize_host(&service_cfg.host),
                tls: service_cfg.tls.clone(),
                locations,
            });

            by_name.insert(service.name.clone(), Arc::clone(&service));
            by_host
                .entry(service.host.clone())
                .or_default()
                .push(Arc::clone(&service));
            order.push(service);
        }

        Ok(Self {
            order,
            by_name,
            by_host,
        })
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.order
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.by_name.get(name).cloned()
    }

    /// Host + longest-path-prefix match. Ties break by registration
    /// order: the first location registered at the winning length wins.
    pub fn match_route(
        &self,
        host: &str,
        request_path: &str,
    ) -> Option<(Arc<Service>, Arc<Location>)> {
        let candidates = self.by_host.get(&normalize_host(host))?;

        let mut best: Option<(usize, Arc<Service>, Arc<Location>)> = None;
        for service in candidates {
            for location in &service.locations {
                if let Some(len) = location.match_len(request_path) {
                    let better = match &best {
                        Some((best_len, _, _)) => len > *best_len,
                        None => true,
                    };
                    if better {
                        best = Some((len, Arc::clone(service), Arc::clone(location)));
                    }
                }
            }
        }
        best.map(|(_, service, location)| (service, location))
    }
}

/// Owns the live registry and the prober lifecycle. The registry itself is
/// swapped in one pointer store; readers clone the Arc under a read lock
/// held for the copy only.
pub struct ServiceManager {
    registry: RwLock<Arc<Registry>>,
    probers: Mutex<HashMap<(String, String), ProberSet>>,
    config: RwLock<Arc<Config>>,
}

impl ServiceManager {
    /// Build from a validated config. Probers are not started yet; call
    /// `start_health_checks` once a runtime is driving.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let registry = Registry::build(&config, None).context("building service registry")?;
        Ok(Self {
            registry: RwLock::new(Arc::new(registry)),
            probers: Mutex::new(HashMap::new()),
            config: RwLock::new(Arc::new(config)),
        })
    }

    /// Current routing table; cheap Arc clone
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry.read().expect("registry lock poisoned"))
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read().expect("config lock poisoned"))
    }

    pub fn match_route(
        &self,
        host: &str,
        request_path: &str,
    ) -> Option<(Arc<Service>, Arc<Location>)> {
        self.registry().match_route(host, request_path)
    }

    /// Spawn probers for every backend of every pool
    pub fn start_health_checks(&self) {
        let registry = self.registry();
        let mut probers = self.probers.lock().expect("probers lock poisoned");
        for service in registry.services() {
            for location in &service.locations {
                probers
                    .entry((service.name.clone(), location.path.clone()))
                    .or_default()
                    .sync(&location.pool.snapshot());
            }
        }
    }

    /// Atomically replace the routing table with one built from
    /// `new_config`. Pools keyed by (service, path) are reused so live
    /// state survives; a config that fails validation leaves everything
    /// untouched. Probers for dropped locations are cancelled, probers
    /// for new backends started after the swap.
    pub fn apply(&self, new_config: Config) -> Result<()> {
        new_config.validate()?;

        let new_registry = {
            let current = self.registry();
            Arc::new(
                Registry::build(&new_config, Some(&current))
                    .context("rebuilding service registry")?,
            )
        };

        *self.registry.write().expect("registry lock poisoned") = Arc::clone(&new_registry);
        *self.config.write().expect("config lock poisoned") = Arc::new(new_config);

        self.sync_probers(&new_registry);
        info!("configuration applied");
        Ok(())
    }

    fn sync_probers(&self, registry: &Registry) {
        let mut probers = self.probers.lock().expect("probers lock poisoned");

        let mut wanted: HashMap<(String, String), Vec<Arc<Backend>>> = HashMap::new();
        for service in registry.services() {
            for location in &service.locations {
                wanted.insert(
                    (service.name.clone(), location.path.clone()),
                    location.pool.snapshot(),
                );
            }
        }

        probers.retain(|key, set| {
            if wanted.contains_key(key) {
                true
            } else {
                debug!(service = %key.0, path = %key.1, "stopping probers for dropped location");
                set.shutdown();
                false
            }
        });

        for (key, backends) in wanted {
            probers.entry(key).or_default().sync(&backends);
        }
    }

    /// Resolve a (service, optional path) pair the way the admin API
    /// addresses locations: an omitted path is only valid when the
    /// service has exactly one location.
    pub fn locate(
        &self,
        service_name: &str,
        path: Option<&str>,
    ) -> Result<(Arc<Service>, Arc<Location>), ProxyError> {
        let registry = self.registry();
        let service = registry
            .get_service(service_name)
            .ok_or_else(|| ProxyError::ServiceNotFound(service_name.to_string()))?;

        let location = match path {
            Some(p) => {
                let normalized = normalize_path(p);
                service
                    .locations
                    .iter()
                    .find(|l| l.path == normalized)
                    .cloned()
                    .ok_or_else(|| ProxyError::LocationNotFound(normalized))?
            }
            None if service.locations.len() == 1 => Arc::clone(&service.locations[0]),
            None => return Err(ProxyError::AmbiguousLocation),
        };

        Ok((service, location))
    }

    /// Runtime backend addition via the admin interface
    pub fn add_backend(
        &self,
        service_name: &str,
        path: Option<&str>,
        cfg: &BackendConfig,
    ) -> Result<(), ProxyError> {
        let (service, location) = self.locate(service_name, path)?;
        let health = self.resolve_health(&service.name, cfg);
        location.pool.add_backend(cfg, health)?;

        let mut probers = self.probers.lock().expect("probers lock poisoned");
        probers
            .entry((service.name.clone(), location.path.clone()))
            .or_default()
            .sync(&location.pool.snapshot());

        info!(service = %service.name, path = %location.path, backend = %cfg.url, "backend added");
        Ok(())
    }

    /// Runtime backend removal via the admin interface. In-flight requests
    /// holding the backend finish normally.
    pub fn remove_backend(
        &self,
        service_name: &str,
        path: Option<&str>,
        url: &str,
    ) -> Result<(), ProxyError> {
        let (service, location) = self.locate(service_name, path)?;
        location.pool.remove_backend(url)?;

        let mut probers = self.probers.lock().expect("probers lock poisoned");
        if let Some(set) = probers.get_mut(&(service.name.clone(), location.path.clone())) {
            set.sync(&location.pool.snapshot());
        }

        info!(service = %service.name, path = %location.path, backend = %url, "backend removed");
        Ok(())
    }

    fn resolve_health(
        &self,
        service_name: &str,
        backend: &BackendConfig,
    ) -> crate::config::HealthCheckSpec {
        let config = self.config();
        config
            .services
            .iter()
            .find(|s| s.name == service_name)
            .map(|s| config.resolve_health_check(s, backend))
            .unwrap_or_else(|| config.health_check.clone())
    }

    /// Stop all probers; part of graceful shutdown
    pub fn shutdown(&self) {
        let mut probers = self.probers.lock().expect("probers lock poisoned");
        for (_, set) in probers.iter_mut() {
            set.shutdown();
        }
        probers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocationConfig, ServiceConfig};

    fn location_cfg(path: &str, backends: &[&str]) -> LocationConfig {
        LocationConfig {
            path: path.to_string(),
            lb_policy: "round_robin".to_string(),
            http_redirect: false,
            redirect: None,
            rewrite: None,
            max_connections: 100,
            backends: backends
                .iter()
                .map(|url| BackendConfig {
                    url: url.to_string(),
                    weight: 1,
                    max_connections: 0,
                    health_check: None,
                })
                .collect(),
        }
    }

    fn test_config() -> Config {
        Config {
            services: vec![ServiceConfig {
                name: "web".to_string(),
                host: "a.test".to_string(),
                tls: None,
                health_check: None,
                locations: vec![
                    location_cfg("/", &["http://root-1:80"]),
                    location_cfg("/api/", &["http://api-1:80", "http://api-2:80"]),
                ],
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("A.Test:8443"), "a.test");
        assert_eq!(normalize_host("a.test"), "a.test");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
    }

    #[test]
    fn test_longest_prefix_routing() {
        let manager = ServiceManager::new(test_config()).unwrap();

        let (_, location) = manager.match_route("a.test", "/api/v1/x").unwrap();
        assert_eq!(location.path, "/api/");

        let (_, location) = manager.match_route("a.test", "/health").unwrap();
        assert_eq!(location.path, "/");

        assert!(manager.match_route("b.test", "/").is_none());
    }

    #[test]
    fn test_host_match_strips_port_and_case() {
        let manager = ServiceManager::new(test_config()).unwrap();
        assert!(manager.match_route("A.TEST:8443", "/x").is_some());
    }

    #[test]
    fn test_empty_path_is_catch_all() {
        let mut config = test_config();
        config.services[0].locations[0].path = String::new();
        let manager = ServiceManager::new(config).unwrap();

        let (_, location) = manager.match_route("a.test", "/anything").unwrap();
        assert_eq!(location.path, "/");
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let mut config = test_config();
        config.services[0]
            .locations
            .push(location_cfg("/api/", &["http://api-3:80"]));
        let manager = ServiceManager::new(config).unwrap();

        let (_, location) = manager.match_route("a.test", "/api/x").unwrap();
        let snapshot = location.pool.snapshot();
        assert_eq!(snapshot.len(), 2, "first-registered /api/ location wins");
    }

    #[test]
    fn test_rewrite_path() {
        let location = Location {
            path: "/api/".to_string(),
            rewrite: Some("/v2/".to_string()),
            redirect: None,
            http_redirect: false,
            pool: Arc::new(ServerPool::new(Policy::RoundRobin, 10)),
        };
        assert_eq!(location.rewrite_path("/api/users"), "/v2/users");
        assert_eq!(location.rewrite_path("/api/"), "/v2/");

        let no_rewrite = Location {
            path: "/api/".to_string(),
            rewrite: None,
            redirect: None,
            http_redirect: false,
            pool: Arc::new(ServerPool::new(Policy::RoundRobin, 10)),
        };
        assert_eq!(no_rewrite.rewrite_path("/api/users"), "/api/users");
    }

    #[test]
    fn test_rewrite_from_catch_all() {
        let location = Location {
            path: "/".to_string(),
            rewrite: Some("/app/".to_string()),
            redirect: None,
            http_redirect: false,
            pool: Arc::new(ServerPool::new(Policy::RoundRobin, 10)),
        };
        assert_eq!(location.rewrite_path("/users"), "/app/users");
    }

    #[test]
    fn test_redirect_target() {
        let location = Location {
            path: "/old/".to_string(),
            rewrite: None,
            redirect: Some(RedirectConfig {
                from: "/old/".to_string(),
                to: "/new/".to_string(),
            }),
            http_redirect: false,
            pool: Arc::new(ServerPool::new(Policy::RoundRobin, 10)),
        };
        assert_eq!(
            location.redirect_target("/old/page").as_deref(),
            Some("/new/page")
        );
        assert_eq!(location.redirect_target("/other"), None);
    }

    #[tokio::test]
    async fn test_apply_reuses_pools_and_state() {
        let manager = ServiceManager::new(test_config()).unwrap();

        let (_, location) = manager.match_route("a.test", "/api/x").unwrap();
        let pool_before = Arc::clone(&location.pool);
        let backend = &pool_before.snapshot()[0];
        assert!(backend.try_acquire());
        backend.set_alive(false);
        let backend_url = backend.url_str().to_string();

        manager.apply(test_config()).unwrap();

        let (_, location) = manager.match_route("a.test", "/api/x").unwrap();
        assert!(Arc::ptr_eq(&location.pool, &pool_before));
        let kept = location
            .pool
            .snapshot()
            .into_iter()
            .find(|b| b.url_str() == backend_url)
            .unwrap();
        assert_eq!(kept.connection_count(), 1);
        assert!(!kept.is_alive());
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let manager = ServiceManager::new(test_config()).unwrap();
        let pool = Arc::clone(&manager.match_route("a.test", "/api/x").unwrap().1.pool);
        let first = pool.snapshot();

        manager.apply(test_config()).unwrap();
        manager.apply(test_config()).unwrap();

        let after = manager
            .match_route("a.test", "/api/x")
            .unwrap()
            .1
            .pool
            .snapshot();
        assert_eq!(first.len(), after.len());
        for (a, b) in first.iter().zip(after.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[tokio::test]
    async fn test_apply_rejects_invalid_config() {
        let manager = ServiceManager::new(test_config()).unwrap();
        let registry_before = manager.registry();

        let mut bad = test_config();
        bad.services[0].locations[0].lb_policy = "wishful_thinking".to_string();
        assert!(manager.apply(bad).is_err());

        // Old registry still installed
        assert!(Arc::ptr_eq(&registry_before, &manager.registry()));
    }

    #[tokio::test]
    async fn test_apply_drops_removed_service() {
        let manager = ServiceManager::new(test_config()).unwrap();
        manager.start_health_checks();

        let mut config = test_config();
        config.services[0].locations.truncate(1);
        manager.apply(config).unwrap();

        assert!(manager.match_route("a.test", "/api/x").is_some());
        let (_, location) = manager.match_route("a.test", "/api/x").unwrap();
        assert_eq!(location.path, "/", "the /api/ location is gone");
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_admin_add_remove_backend() {
        let manager = ServiceManager::new(test_config()).unwrap();

        manager
            .add_backend(
                "web",
                Some("/api/"),
                &BackendConfig {
                    url: "http://api-3:80".to_string(),
                    weight: 1,
                    max_connections: 0,
                    health_check: None,
                },
            )
            .unwrap();
        let (_, location) = manager.match_route("a.test", "/api/x").unwrap();
        assert_eq!(location.pool.snapshot().len(), 3);

        manager
            .remove_backend("web", Some("/api/"), "http://api-3:80")
            .unwrap();
        assert_eq!(location.pool.snapshot().len(), 2);
    }

    #[test]
    fn test_locate_ambiguous_location() {
        let manager = ServiceManager::new(test_config()).unwrap();
        assert!(matches!(
            manager.locate("web", None),
            Err(ProxyError::AmbiguousLocation)
        ));
        assert!(matches!(
            manager.locate("nope", None),
            Err(ProxyError::ServiceNotFound(_))
        ));
        assert!(matches!(
            manager.locate("web", Some("/missing/")),
            Err(ProxyError::LocationNotFound(_))
        ));
    }
}
