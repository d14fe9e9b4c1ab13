use dockroute::config::Config;
use dockroute::discovery::Reconciler;
use dockroute::docker::DockerDiscovery;
use dockroute::naming::SubdomainPolicy;
use dockroute::proxy::{self, ProxyServer};
use dockroute::routes::RouteTable;
use dockroute::{PKG_NAME, VERSION};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Command line: `dockroute [config.toml] [--debug]`
struct CliArgs {
    config_path: PathBuf,
    explicit_path: bool,
    debug: bool,
}

impl CliArgs {
    fn parse() -> Self {
        let mut config_path = None;
        let mut debug = false;

        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--debug" | "-d" => debug = true,
                _ if config_path.is_none() => config_path = Some(PathBuf::from(arg)),
                _ => {}
            }
        }

        Self {
            explicit_path: config_path.is_some(),
            config_path: config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            debug,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // Configuration is read before logging so `debug` can pick the filter
    let (mut config, loaded_from_file) = if args.explicit_path || args.config_path.exists() {
        (Config::load(&args.config_path)?, true)
    } else {
        (Config::default(), false)
    };
    config.server.debug |= args.debug;

    let level = if config.server.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                format!("{}={}", PKG_NAME, level)
                    .parse()
                    .expect("valid log directive"),
            ),
        )
        .init();

    if loaded_from_file {
        info!(path = %args.config_path.display(), "Configuration loaded");
    } else {
        info!(path = %args.config_path.display(), "No configuration file, using defaults");
    }

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tls_acceptor = if config.server.tls_enabled() {
        // More than one provider may be compiled in through dependencies
        let _ = rustls::crypto::ring::default_provider().install_default();

        let (certs, key) = if config.server.has_tls_files() {
            let (Some(cert_path), Some(key_path)) =
                (config.server.tls_cert.as_deref(), config.server.tls_key.as_deref())
            else {
                anyhow::bail!("server.tls_cert and server.tls_key must be set together");
            };
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
            (certs, key)
        } else {
            let (certs, key) = generate_self_signed_cert()?;
            warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
            (certs, key)
        };

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(
                bind = %config.server.bind,
                port = config.server.port,
                error = %e,
                "Invalid bind address"
            );
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Bind before anything else is started: a busy port is fatal
    let listener = proxy::bind(bind_addr).await?;

    let table = RouteTable::shared();

    let docker = DockerDiscovery::connect(&config.discovery).await?;
    let policy = SubdomainPolicy::from_config(&config.routing);
    let reconciler = Arc::new(Reconciler::new(
        docker,
        policy,
        Arc::clone(&table),
        &config.discovery,
    ));

    let discovery_shutdown = shutdown_rx.clone();
    let discovery_handle = tokio::spawn(async move {
        reconciler.run(discovery_shutdown).await;
    });

    let mut server = ProxyServer::new(Arc::clone(&table), &config, shutdown_rx.clone());
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }
    let pool_stats = server.pool_stats();

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = discovery_handle.await;
    })
    .await;

    info!(
        routes = table.len(),
        forwarded_requests = pool_stats.get_total_requests(),
        failed_requests = pool_stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting container router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls = config.server.tls_enabled(),
        connect_timeout_ms = config.server.connect_timeout_ms,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        docker_host = config.discovery.docker_host.as_deref().unwrap_or("(auto)"),
        poll_interval_ms = config.discovery.poll_interval_ms,
        eviction = ?config.discovery.eviction,
        "Discovery settings"
    );
    info!(
        domain_suffix = config.routing.domain_suffix.as_deref().unwrap_or("(none)"),
        primary_port = config.routing.primary_port,
        tunnel_scheme = %config.routing.tunnel.scheme,
        tunnel_port = config.routing.tunnel.port,
        sub_routes = ?config
            .routing
            .sub_routes
            .iter()
            .map(|s| format!("{}:{}", s.prefix, s.port))
            .collect::<Vec<_>>(),
        "Routing conventions"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}

fn generate_self_signed_cert(
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}
