use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Inbound listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Container discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// How routes are derived from container names
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Verbose diagnostic logging. No behavioral effect.
    #[serde(default)]
    pub debug: bool,

    /// Serve HTTPS instead of HTTP. If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Timeout for dialing a backend, in milliseconds (default: 10000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum time to wait for a forwarded HTTP response (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            errors.push("server.tls_cert and server.tls_key must be set together".to_string());
        }
        if self.connect_timeout_ms == 0 {
            errors.push("server.connect_timeout_ms must be greater than 0".to_string());
        }
        if self.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            debug: false,
            tls: false,
            tls_cert: None,
            tls_key: None,
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// What happens to routes of containers that disappear between polls
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Routes are only ever added or overwritten (default)
    #[default]
    Never,
    /// Routes owned by containers missing from a successful listing are removed
    Absent,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Interval between reconciliation cycles in milliseconds (default: 30000)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Docker endpoint: unix://, tcp://, http:// or https://
    /// (default: DOCKER_HOST, then common socket paths)
    pub docker_host: Option<String>,

    /// Client certificate for https:// Docker endpoints
    pub tls_cert: Option<String>,

    /// Client private key for https:// Docker endpoints
    pub tls_key: Option<String>,

    /// CA certificate for https:// Docker endpoints
    pub tls_ca: Option<String>,

    /// Timeout for each Docker API call in seconds (default: 30)
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    /// Maximum container inspections in flight per cycle (default: 8)
    #[serde(default = "default_inspect_concurrency")]
    pub inspect_concurrency: usize,

    /// Route eviction policy (default: never)
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.poll_interval_ms == 0 {
            errors.push("discovery.poll_interval_ms must be greater than 0".to_string());
        }
        if self.api_timeout_secs == 0 {
            errors.push("discovery.api_timeout_secs must be greater than 0".to_string());
        }
        if self.inspect_concurrency == 0 {
            errors.push("discovery.inspect_concurrency must be greater than 0".to_string());
        }
        let uses_tls = self
            .docker_host
            .as_deref()
            .is_some_and(|h| h.starts_with("https://"));
        if uses_tls
            && (self.tls_cert.is_none() || self.tls_key.is_none() || self.tls_ca.is_none())
        {
            errors.push(
                "discovery.docker_host uses https:// but tls_cert, tls_key and tls_ca \
                 are not all set"
                    .to_string(),
            );
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            docker_host: None,
            tls_cert: None,
            tls_key: None,
            tls_ca: None,
            api_timeout_secs: default_api_timeout(),
            inspect_concurrency: default_inspect_concurrency(),
            eviction: EvictionPolicy::default(),
        }
    }
}

/// Protocol qualifier and backend port used for CONNECT tunnel routes
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TunnelRouteConfig {
    #[serde(default = "default_tunnel_scheme")]
    pub scheme: String,
    #[serde(default = "default_tunnel_port")]
    pub port: u16,
}

impl Default for TunnelRouteConfig {
    fn default() -> Self {
        Self {
            scheme: default_tunnel_scheme(),
            port: default_tunnel_port(),
        }
    }
}

/// A named subdomain that maps to a fixed backend port,
/// e.g. `api.<root>` -> `<ip>:3000`
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SubRouteConfig {
    pub prefix: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// Domain appended to container names (e.g. "hapi.co" turns `/blog` into `blog.hapi.co`)
    pub domain_suffix: Option<String>,

    /// Backend port of the primary HTTP route (default: 8080)
    #[serde(default = "default_primary_port")]
    pub primary_port: u16,

    /// Use the container's lowest exposed TCP port for the primary route when it has one
    #[serde(default)]
    pub prefer_exposed_port: bool,

    /// Prefixes that are registered a second time without the prefix (default: ["www."])
    #[serde(default = "default_alias_prefixes")]
    pub alias_prefixes: Vec<String>,

    /// Tunnel route registration
    #[serde(default)]
    pub tunnel: TunnelRouteConfig,

    /// Additional subdomain conventions keyed off the same root
    #[serde(default)]
    pub sub_routes: Vec<SubRouteConfig>,
}

impl RoutingConfig {
    fn validate(&self, errors: &mut Vec<String>) {
        if self.primary_port == 0 {
            errors.push("routing.primary_port must be non-zero".to_string());
        }
        if self.tunnel.port == 0 {
            errors.push("routing.tunnel.port must be non-zero".to_string());
        }
        if self.tunnel.scheme.trim().is_empty() {
            errors.push("routing.tunnel.scheme must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for sub in &self.sub_routes {
            let prefix = sub.prefix.trim_end_matches('.');
            if prefix.is_empty() {
                errors.push("routing.sub_routes: prefix must not be empty".to_string());
                continue;
            }
            if sub.port == 0 {
                errors.push(format!("routing.sub_routes '{}': port must be non-zero", prefix));
            }
            if !seen.insert(prefix.to_ascii_lowercase()) {
                errors.push(format!("routing.sub_routes '{}': duplicate prefix", prefix));
            }
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            domain_suffix: None,
            primary_port: default_primary_port(),
            prefer_exposed_port: false,
            alias_prefixes: default_alias_prefixes(),
            tunnel: TunnelRouteConfig::default(),
            sub_routes: Vec::new(),
        }
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_poll_interval() -> u64 {
    30_000
}

fn default_api_timeout() -> u64 {
    30
}

fn default_inspect_concurrency() -> usize {
    8
}

fn default_primary_port() -> u16 {
    8080
}

fn default_alias_prefixes() -> Vec<String> {
    vec!["www.".to_string()]
}

fn default_tunnel_scheme() -> String {
    "ssh".to_string()
}

fn default_tunnel_port() -> u16 {
    22
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        self.server.validate(&mut errors);
        self.discovery.validate(&mut errors);
        self.routing.validate(&mut errors);

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
