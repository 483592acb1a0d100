use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Health probe settings. Resolution order for a backend is: backend
/// override, then service default, then the top-level default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// HTTP path probed on each backend
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Seconds between probes
    #[serde(default = "default_health_interval")]
    pub interval: u64,

    /// Probe timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub thresholds: Thresholds,
}

/// Consecutive-probe counts required to flip a backend's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_healthy_threshold")]
    pub healthy: u32,

    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy: u32,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    5
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            healthy: default_healthy_threshold(),
            unhealthy: default_unhealthy_threshold(),
        }
    }
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            thresholds: Thresholds::default(),
        }
    }
}

impl HealthCheckSpec {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// A single upstream server within a location's pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Upstream URL, e.g. "http://10.0.0.5:9000"
    pub url: String,

    /// Relative weight for the weighted policies
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Per-backend connection cap; 0 inherits the location default
    #[serde(default)]
    pub max_connections: u32,

    /// Per-backend probe override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
}

fn default_weight() -> u32 {
    1
}

/// Client-side path substitution issued as a 301
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectConfig {
    pub from: String,
    pub to: String,
}

/// A path-prefix routing entry owning one backend pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Path prefix matched against the request path. "" and "/" both act
    /// as the catch-all.
    #[serde(default = "default_location_path")]
    pub path: String,

    /// One of: round_robin, weighted_round_robin, least_connections,
    /// weighted_least_connections, response_time, ip_hash,
    /// consistent_hash, adaptive
    #[serde(default = "default_policy")]
    pub lb_policy: String,

    /// Redirect plain-HTTP requests at this location to HTTPS
    #[serde(default)]
    pub http_redirect: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<RedirectConfig>,

    /// Replacement for the location path prefix on the upstream-bound path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,

    /// Default connection cap for backends that don't set their own
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

fn default_location_path() -> String {
    "/".to_string()
}

fn default_policy() -> String {
    "round_robin".to_string()
}

fn default_max_connections() -> u32 {
    1000
}

/// TLS identity for a virtual host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// A virtual-host-scoped container of locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique service key
    pub name: String,

    /// Virtual host, matched case-insensitively with the port stripped
    pub host: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Default probe spec for this service's backends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,

    pub locations: Vec<LocationConfig>,
}

/// Token-bucket settings, consumed by the external rate-limit middleware
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

/// Outbound connection pool sizing for the upstream HTTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,

    /// Upper bound on open upstream connections; 0 leaves it to the
    /// per-backend caps
    #[serde(default)]
    pub max_open: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_max_idle() -> usize {
    32
}

fn default_idle_timeout() -> u64 {
    90
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_open: 0,
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data-plane listener port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Admin listener port; the admin API is disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_port: Option<u16>,

    /// Optional secondary plain-HTTP port, used for redirect-to-HTTPS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,

    /// Key client hashes off the first X-Forwarded-For value instead of
    /// the socket address
    #[serde(default)]
    pub trust_proxy_headers: bool,

    /// Global default probe spec
    #[serde(default)]
    pub health_check: HealthCheckSpec,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            admin_port: None,
            http_port: None,
            trust_proxy_headers: false,
            health_check: HealthCheckSpec::default(),
            rate_limit: None,
            connection_pool: ConnectionPoolConfig::default(),
            services: Vec::new(),
        }
    }
}

impl Config {
    /// Reject configs the proxy cannot route with. Called before startup
    /// and before every reload so a bad reload never tears down the
    /// running registry.
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            anyhow::bail!("at least one service is required");
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                anyhow::bail!("service name cannot be empty");
            }
            if service.host.trim().is_empty() {
                anyhow::bail!("service '{}': host cannot be empty", service.name);
            }
            if !names.insert(service.name.as_str()) {
                anyhow::bail!("duplicate service name '{}'", service.name);
            }
            if service.locations.is_empty() {
                anyhow::bail!("service '{}' has no locations", service.name);
            }

            for location in &service.locations {
                crate::lb::Policy::parse(&location.lb_policy).with_context(|| {
                    format!("service '{}' location '{}'", service.name, location.path)
                })?;

                for backend in &location.backends {
                    let url = url::Url::parse(&backend.url).with_context(|| {
                        format!(
                            "service '{}' location '{}': invalid backend url '{}'",
                            service.name, location.path, backend.url
                        )
                    })?;
                    if url.host_str().is_none() {
                        anyhow::bail!(
                            "service '{}' location '{}': backend url '{}' has no host",
                            service.name,
                            location.path,
                            backend.url
                        );
                    }
                    if backend.weight == 0 {
                        anyhow::bail!(
                            "service '{}' location '{}': backend '{}' weight must be positive",
                            service.name,
                            location.path,
                            backend.url
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolve the probe spec for one backend of a service
    pub fn resolve_health_check(
        &self,
        service: &ServiceConfig,
        backend: &BackendConfig,
    ) -> HealthCheckSpec {
        backend
            .health_check
            .clone()
            .or_else(|| service.health_check.clone())
            .unwrap_or_else(|| self.health_check.clone())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
port: 9000
services:
  - name: api
    host: api.example.com
    locations:
      - path: /
        lb_policy: round_robin
        backends:
          - url: http://10.0.0.1:8081
          - url: http://10.0.0.2:8081
            weight: 3
"#
    }

    #[test]
    fn test_parse_minimal() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.services.len(), 1);

        let service = &config.services[0];
        assert_eq!(service.name, "api");
        assert_eq!(service.host, "api.example.com");

        let location = &service.locations[0];
        assert_eq!(location.path, "/");
        assert_eq!(location.backends.len(), 2);
        assert_eq!(location.backends[0].weight, 1);
        assert_eq!(location.backends[1].weight, 3);
        assert_eq!(location.max_connections, 1000);

        config.validate().unwrap();
    }

    #[test]
    fn test_health_check_defaults() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(config.health_check.path, "/health");
        assert_eq!(config.health_check.interval, 10);
        assert_eq!(config.health_check.thresholds.healthy, 2);
        assert_eq!(config.health_check.thresholds.unhealthy, 3);
    }

    #[test]
    fn test_health_check_resolution() {
        let yaml = r#"
health_check:
  path: /global
services:
  - name: api
    host: api.example.com
    health_check:
      path: /svc
    locations:
      - path: /
        backends:
          - url: http://10.0.0.1:8081
          - url: http://10.0.0.2:8081
            health_check:
              path: /backend
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let service = &config.services[0];
        let plain = &service.locations[0].backends[0];
        let overridden = &service.locations[0].backends[1];

        assert_eq!(config.resolve_health_check(service, plain).path, "/svc");
        assert_eq!(
            config.resolve_health_check(service, overridden).path,
            "/backend"
        );
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let yaml = r#"
services:
  - name: api
    host: api.example.com
    locations:
      - path: /
        lb_policy: fastest_guess
        backends:
          - url: http://10.0.0.1:8081
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backend_url_rejected() {
        let yaml = r#"
services:
  - name: api
    host: api.example.com
    locations:
      - path: /
        backends:
          - url: "not a url"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_weight_rejected() {
        let yaml = r#"
services:
  - name: api
    host: api.example.com
    locations:
      - path: /
        backends:
          - url: http://10.0.0.1:8081
            weight: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_service_name_rejected() {
        let yaml = r#"
services:
  - name: api
    host: a.example.com
    locations:
      - path: /
        backends:
          - url: http://10.0.0.1:8081
  - name: api
    host: b.example.com
    locations:
      - path: /
        backends:
          - url: http://10.0.0.2:8081
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
