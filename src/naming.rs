//! Derivation of routes from workload metadata
//!
//! Which subdomains map to which backend ports is deployment policy. The
//! reconciler asks a [`NamingPolicy`] for the routes of each workload and stays
//! unaware of the convention in use.

use crate::config::{RoutingConfig, SubRouteConfig, TunnelRouteConfig};
use crate::docker::Workload;
use crate::routes::{Endpoint, Qualifier, RouteEntry, RoutingKey};

/// Strategy mapping a workload to the routes that should point at it
pub trait NamingPolicy: Send + Sync + 'static {
    fn routes_for(&self, workload: &Workload) -> Vec<RouteEntry>;
}

/// Default policy: the container name is the virtual-host root.
///
/// For a root `r` and workload address `ip` it registers:
/// - `{r, tunnel qualifier}` -> `ip:<tunnel port>`
/// - `{r}` -> `ip:<primary port>`
/// - `{<prefix>.r}` -> `ip:<port>` for each configured sub-route
///
/// and, when `r` starts with an alias prefix such as `www.`, the same set again
/// for the de-aliased root.
#[derive(Debug, Clone)]
pub struct SubdomainPolicy {
    domain_suffix: Option<String>,
    primary_port: u16,
    prefer_exposed_port: bool,
    alias_prefixes: Vec<String>,
    tunnel: TunnelRouteConfig,
    sub_routes: Vec<SubRouteConfig>,
}

impl SubdomainPolicy {
    pub fn from_config(config: &RoutingConfig) -> Self {
        let domain_suffix = config
            .domain_suffix
            .as_deref()
            .map(|s| s.trim_matches('.').to_ascii_lowercase())
            .filter(|s| !s.is_empty());

        let sub_routes = config
            .sub_routes
            .iter()
            .map(|sub| SubRouteConfig {
                prefix: sub.prefix.trim_end_matches('.').to_ascii_lowercase(),
                port: sub.port,
            })
            .collect();

        Self {
            domain_suffix,
            primary_port: config.primary_port,
            prefer_exposed_port: config.prefer_exposed_port,
            alias_prefixes: config
                .alias_prefixes
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            tunnel: config.tunnel.clone(),
            sub_routes,
        }
    }

    /// Qualifier used for tunnel routes
    pub fn tunnel_qualifier(&self) -> Qualifier {
        Qualifier::new(&self.tunnel.scheme, self.tunnel.port)
    }

    /// Canonical virtual-host root for a container name: the leading `/` the
    /// orchestrator anchors names with is stripped and the domain suffix appended.
    pub fn virtual_host_root(&self, name: &str) -> Option<String> {
        let base = name.trim_start_matches('/').trim().to_ascii_lowercase();
        if base.is_empty() {
            return None;
        }
        match &self.domain_suffix {
            Some(suffix) => Some(format!("{}.{}", base, suffix)),
            None => Some(base),
        }
    }

    fn primary_port(&self, workload: &Workload) -> u16 {
        if self.prefer_exposed_port {
            if let Some(port) = workload.exposed_ports.first() {
                return *port;
            }
        }
        self.primary_port
    }

    fn push_routes_for_root(&self, root: &str, workload: &Workload, out: &mut Vec<RouteEntry>) {
        let ip = &workload.ip_address;

        out.push(RouteEntry::new(
            RoutingKey::qualified(root, self.tunnel_qualifier()),
            Endpoint::new(ip.clone(), self.tunnel.port),
        ));
        out.push(RouteEntry::new(
            RoutingKey::host(root),
            Endpoint::new(ip.clone(), self.primary_port(workload)),
        ));
        for sub in &self.sub_routes {
            out.push(RouteEntry::new(
                RoutingKey::host(format!("{}.{}", sub.prefix, root)),
                Endpoint::new(ip.clone(), sub.port),
            ));
        }
    }

    fn dealiased<'a>(&self, root: &'a str) -> Option<&'a str> {
        self.alias_prefixes
            .iter()
            .find_map(|prefix| root.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty())
    }
}

impl NamingPolicy for SubdomainPolicy {
    fn routes_for(&self, workload: &Workload) -> Vec<RouteEntry> {
        let Some(root) = self.virtual_host_root(&workload.name) else {
            return Vec::new();
        };
        if workload.ip_address.is_empty() {
            return Vec::new();
        }

        let mut routes = Vec::with_capacity(2 * (2 + self.sub_routes.len()));
        self.push_routes_for_root(&root, workload, &mut routes);
        if let Some(bare) = self.dealiased(&root) {
            self.push_routes_for_root(bare, workload, &mut routes);
        }
        routes
    }
}
