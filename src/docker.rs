//! Docker-backed workload discovery
//!
//! The reconciler only depends on the [`DiscoveryClient`] trait. [`DockerDiscovery`]
//! implements it against a Docker daemon reached over a Unix socket, plain TCP,
//! or TLS-authenticated HTTPS.

use crate::config::DiscoveryConfig;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use bollard::Docker;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout handed to bollard for each HTTP request, in seconds
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Errors from talking to the container orchestrator
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("docker API call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed container data: {0}")]
    Malformed(String),
}

/// Entry of a container listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSummary {
    pub id: String,
}

/// Inspected container: enough to derive and target its routes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub id: String,
    /// Container name as reported by the orchestrator, usually with a leading `/`
    pub name: String,
    pub ip_address: String,
    /// Exposed TCP ports, ascending
    pub exposed_ports: Vec<u16>,
}

/// Source of truth for running workloads
pub trait DiscoveryClient: Send + Sync + 'static {
    /// List running workloads
    fn list_workloads(
        &self,
    ) -> impl Future<Output = Result<Vec<WorkloadSummary>, DiscoveryError>> + Send;

    /// Inspect a single workload. `Ok(None)` means it vanished or has no
    /// routable address.
    fn inspect_workload(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Workload>, DiscoveryError>> + Send;
}

/// Discovers workloads from a Docker daemon
pub struct DockerDiscovery {
    client: Docker,
    api_timeout: Duration,
}

impl DockerDiscovery {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. `discovery.docker_host` from configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(config: &DiscoveryConfig) -> anyhow::Result<Self> {
        let client = if let Some(host) = config.docker_host.as_deref() {
            Self::connect_to_host(host, config).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the endpoint is correct.",
                    host,
                    e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host, config).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        // A daemon that is down at startup is not fatal: discovery retries every cycle
        match tokio::time::timeout(config.api_timeout(), client.ping()).await {
            Ok(Ok(_)) => debug!("Connected to Docker daemon"),
            Ok(Err(e)) => warn!(error = %e, "Docker daemon is not responding yet"),
            Err(_) => warn!("Docker daemon ping timed out"),
        }

        Ok(Self::with_client(client, config.api_timeout()))
    }

    pub fn with_client(client: Docker, api_timeout: Duration) -> Self {
        Self {
            client,
            api_timeout,
        }
    }

    fn connect_to_host(host: &str, config: &DiscoveryConfig) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(
                socket_path,
                CLIENT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )
            .map_err(|e| {
                anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e)
            })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else if host.starts_with("https://") {
            let (Some(cert), Some(key), Some(ca)) = (
                config.tls_cert.as_deref(),
                config.tls_key.as_deref(),
                config.tls_ca.as_deref(),
            ) else {
                anyhow::bail!("https:// Docker endpoints require tls_cert, tls_key and tls_ca");
            };
            Docker::connect_with_ssl(
                host,
                Path::new(key),
                Path::new(cert),
                Path::new(ca),
                CLIENT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )
            .map_err(|e| anyhow::anyhow!("Cannot connect to TLS endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket', \
                 'tcp://host:port' or 'https://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.starts_with("/.") || path.starts_with("/podman") {
                continue; // Skip paths built from empty env vars
            }

            if Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(
                    path,
                    CLIENT_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                ) {
                    Ok(client) => return Ok(client),
                    Err(e) => debug!(path, name, error = %e, "Docker socket connection failed"),
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon. No Docker socket found at common locations.\n\n\
                 To fix this:\n\
                 - Start Docker Desktop, Colima, or dockerd\n\
                 - Or set DOCKER_HOST environment variable\n\
                 - Or set discovery.docker_host in the configuration\n\n\
                 Underlying error: {}",
                e
            )
        })
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, DiscoveryError>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(self.api_timeout, fut).await {
            Ok(result) => result.map_err(DiscoveryError::from),
            Err(_) => Err(DiscoveryError::Timeout(self.api_timeout)),
        }
    }
}

impl DiscoveryClient for DockerDiscovery {
    async fn list_workloads(&self) -> Result<Vec<WorkloadSummary>, DiscoveryError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .with_timeout(self.client.list_containers(Some(options)))
            .await?;
        Ok(summaries_from_listing(containers))
    }

    async fn inspect_workload(&self, id: &str) -> Result<Option<Workload>, DiscoveryError> {
        let result = self
            .with_timeout(
                self.client
                    .inspect_container(id, None::<InspectContainerOptions>),
            )
            .await;

        match result {
            Ok(inspection) => workload_from_inspection(inspection),
            // Container exited between listing and inspection
            Err(DiscoveryError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn summaries_from_listing(containers: Vec<ContainerSummary>) -> Vec<WorkloadSummary> {
    containers
        .into_iter()
        .filter_map(|c| c.id)
        .filter(|id| !id.is_empty())
        .map(|id| WorkloadSummary { id })
        .collect()
}

/// Convert a container inspection into a [`Workload`].
///
/// The default bridge network reports its address at the top level; containers
/// on user-defined networks only report per-network addresses, in which case
/// the first non-empty one (by network name) is used.
fn workload_from_inspection(
    inspection: ContainerInspectResponse,
) -> Result<Option<Workload>, DiscoveryError> {
    let id = inspection
        .id
        .clone()
        .ok_or_else(|| DiscoveryError::Malformed("inspection without Id".to_string()))?;
    let name = inspection
        .name
        .clone()
        .ok_or_else(|| DiscoveryError::Malformed(format!("container {} has no Name", id)))?;

    let running = inspection
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(true);
    if !running {
        return Ok(None);
    }

    let ip_address = inspection.network_settings.as_ref().and_then(|settings| {
        settings
            .ip_address
            .clone()
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                let networks = settings.networks.as_ref()?;
                let mut names: Vec<&String> = networks.keys().collect();
                names.sort();
                names.into_iter().find_map(|n| {
                    networks[n].ip_address.clone().filter(|ip| !ip.is_empty())
                })
            })
    });

    let Some(ip_address) = ip_address else {
        debug!(container = %name, "Container has no routable IP address");
        return Ok(None);
    };

    let mut exposed_ports: Vec<u16> = inspection
        .config
        .as_ref()
        .and_then(|c| c.exposed_ports.as_ref())
        .map(|ports| ports.keys().filter_map(|p| parse_exposed_port(p)).collect())
        .unwrap_or_default();
    exposed_ports.sort_unstable();
    exposed_ports.dedup();

    Ok(Some(Workload {
        id,
        name,
        ip_address,
        exposed_ports,
    }))
}

/// Parse a Docker exposed-port key such as `8080/tcp`. UDP ports are ignored.
fn parse_exposed_port(key: &str) -> Option<u16> {
    let (port, proto) = key.split_once('/').unwrap_or((key, "tcp"));
    if !proto.eq_ignore_ascii_case("tcp") {
        return None;
    }
    port.parse().ok().filter(|p| *p != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, ContainerState, EndpointSettings, NetworkSettings};
    use std::collections::HashMap;

    fn inspection(name: &str, ip: Option<&str>) -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some("abc123".to_string()),
            name: Some(name.to_string()),
            network_settings: Some(NetworkSettings {
                ip_address: ip.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_exposed_port() {
        assert_eq!(parse_exposed_port("8080/tcp"), Some(8080));
        assert_eq!(parse_exposed_port("3000"), Some(3000));
        assert_eq!(parse_exposed_port("53/udp"), None);
        assert_eq!(parse_exposed_port("0/tcp"), None);
        assert_eq!(parse_exposed_port("http/tcp"), None);
    }

    #[test]
    fn test_workload_from_bridge_inspection() {
        let workload = workload_from_inspection(inspection("/blog", Some("172.17.0.4")))
            .unwrap()
            .unwrap();
        assert_eq!(workload.id, "abc123");
        assert_eq!(workload.name, "/blog");
        assert_eq!(workload.ip_address, "172.17.0.4");
        assert!(workload.exposed_ports.is_empty());
    }

    #[test]
    fn test_workload_falls_back_to_network_address() {
        let mut networks = HashMap::new();
        networks.insert(
            "zz-net".to_string(),
            EndpointSettings {
                ip_address: Some("10.9.0.2".to_string()),
                ..Default::default()
            },
        );
        networks.insert(
            "app-net".to_string(),
            EndpointSettings {
                ip_address: Some("10.1.0.2".to_string()),
                ..Default::default()
            },
        );
        let mut resp = inspection("/api", Some(""));
        resp.network_settings.as_mut().unwrap().networks = Some(networks);

        let workload = workload_from_inspection(resp).unwrap().unwrap();
        assert_eq!(workload.ip_address, "10.1.0.2");
    }

    #[test]
    fn test_workload_without_ip_is_absent() {
        assert_eq!(workload_from_inspection(inspection("/host-net", None)).unwrap(), None);
    }

    #[test]
    fn test_stopped_workload_is_absent() {
        let mut resp = inspection("/stopped", Some("172.17.0.9"));
        resp.state = Some(ContainerState {
            running: Some(false),
            ..Default::default()
        });
        assert_eq!(workload_from_inspection(resp).unwrap(), None);
    }

    #[test]
    fn test_inspection_without_name_is_malformed() {
        let mut resp = inspection("/x", Some("172.17.0.2"));
        resp.name = None;
        assert!(matches!(
            workload_from_inspection(resp),
            Err(DiscoveryError::Malformed(_))
        ));
    }

    #[test]
    fn test_exposed_ports_sorted_tcp_only() {
        let mut exposed = HashMap::new();
        exposed.insert("9000/tcp".to_string(), HashMap::new());
        exposed.insert("3000/tcp".to_string(), HashMap::new());
        exposed.insert("5353/udp".to_string(), HashMap::new());
        let mut resp = inspection("/web", Some("172.17.0.5"));
        resp.config = Some(ContainerConfig {
            exposed_ports: Some(exposed),
            ..Default::default()
        });

        let workload = workload_from_inspection(resp).unwrap().unwrap();
        assert_eq!(workload.exposed_ports, vec![3000, 9000]);
    }

    #[test]
    fn test_summaries_skip_missing_ids() {
        let listing = vec![
            ContainerSummary {
                id: Some("one".to_string()),
                ..Default::default()
            },
            ContainerSummary {
                id: None,
                ..Default::default()
            },
            ContainerSummary {
                id: Some(String::new()),
                ..Default::default()
            },
        ];
        assert_eq!(
            summaries_from_listing(listing),
            vec![WorkloadSummary {
                id: "one".to_string()
            }]
        );
    }
}
