use poolmux::admin::{AdminServer, PKG_NAME, VERSION};
use poolmux::config::Config;
use poolmux::controller::Controller;
use poolmux::heartbeat::Heartbeat;
use poolmux::pool::PoolConfig;
use poolmux::proxy::{FrontendConfig, ProxyServer};
use poolmux::spawner::Spawner;
use poolmux::store::open_store;
use poolmux::tables::{Endpoint, Tables};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("poolmux=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    // Managers are started from the same working directory, but keep the path stable anyway
    let config_path = std::fs::canonicalize(&config_path).unwrap_or(config_path);

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let store = open_store(&config.store).await.map_err(|e| {
        error!(error = %e, "Failed to open table store");
        e
    })?;
    let tables = Arc::new(Tables::new(store));
    let node = Endpoint::new(config.server.host.clone(), config.server.port);

    let spawner = Spawner::new(node.clone(), &config.spawner, config_path.clone());
    let controller = Arc::new(Controller::new(
        Arc::clone(&tables),
        spawner,
        node.clone(),
        &config.controller,
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heartbeat = Heartbeat::new(Arc::clone(&tables), node.clone(), &config.heartbeat);
    let heartbeat_handle = tokio::spawn(heartbeat.run(shutdown_rx.clone()));

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );

    let frontend = FrontendConfig {
        facade_hostname: config.server.facade_hostname.clone(),
        forwarding_timeout: config.server.forwarding_timeout(),
        trusted_proxies: config.server.trusted_proxy_addrs(),
    };

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::with_pool_config(
        proxy_addr,
        Arc::clone(&controller),
        frontend,
        shutdown_rx.clone(),
        pool_config,
    );

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Status API (if admin_port > 0)
    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&tables),
            node.clone(),
            shutdown_rx.clone(),
            admin_token,
        );

        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

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

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout); the heartbeat deregisters this node
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = heartbeat_handle.await;
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // SAFETY: fd belongs to the file we just opened
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        advertised_host = %config.server.host,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        facade_hostname = ?config.server.facade_hostname,
        "Server configuration"
    );

    info!(
        store = config.store.path.as_deref().unwrap_or_default(),
        connect_attempts = config.store.connect_attempts,
        "Table store settings"
    );

    info!(
        manager = %config.spawner.manager_command().display(),
        port_min = config.spawner.port_min,
        port_max = config.spawner.port_max,
        readiness_timeout_secs = config.spawner.readiness_timeout_secs,
        "Spawner settings"
    );

    info!(
        lock_timeout_secs = config.controller.lock_timeout_secs,
        lock_wait_secs = config.controller.lock_wait_secs,
        heartbeat_interval_secs = config.heartbeat.interval_secs,
        heartbeat_ttl_secs = config.heartbeat.ttl_secs,
        "Coordination settings"
    );
}
