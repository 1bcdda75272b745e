use crate::heartbeat::MAX_JITTER;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration shared by the gateway node and its manager children
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and front-end configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared table store
    #[serde(default)]
    pub store: StoreConfig,

    /// Placement and locking
    #[serde(default)]
    pub controller: ControllerConfig,

    /// How the node launches manager children
    #[serde(default)]
    pub spawner: SpawnerConfig,

    /// Node registration
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Settings read by the manager child
    #[serde(default)]
    pub manager: ManagerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Gateway port (default: 8008)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Host name or address other nodes use to reach this node (default: 127.0.0.1)
    #[serde(default = "default_advertised_host")]
    pub host: String,

    /// Port for the status API (default: 8009, set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the status API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Hostname under which requests are routed by access key instead of by host
    pub facade_hostname: Option<String>,

    /// Addresses besides registered nodes whose forwarded requests are trusted
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Upper bound on one forwarded request, in seconds (default: 60)
    #[serde(default = "default_forwarding_timeout")]
    pub forwarding_timeout_secs: u64,

    /// Maximum idle connections per upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional, locked while the gateway runs)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    /// Parsed `trusted_proxies`; entries that are not IP addresses are skipped
    pub fn trusted_proxy_addrs(&self) -> Vec<IpAddr> {
        self.trusted_proxies
            .iter()
            .filter_map(|addr| addr.parse().ok())
            .collect()
    }

    pub fn forwarding_timeout(&self) -> Duration {
        Duration::from_secs(self.forwarding_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            host: default_advertised_host(),
            admin_port: default_admin_port(),
            admin_token: None,
            facade_hostname: None,
            trusted_proxies: Vec::new(),
            forwarding_timeout_secs: default_forwarding_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite file shared by all nodes and their managers (required)
    pub path: Option<String>,

    /// Connection attempts at startup before giving up (default: 10)
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Initial delay between connection attempts, doubled each time (default: 500)
    #[serde(default = "default_connect_backoff")]
    pub connect_backoff_ms: u64,

    /// How long a write waits for another process's lock (default: 5000)
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl StoreConfig {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Lifetime of a pool lock entry in seconds (default: 60)
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Polling interval while waiting for a held lock (default: 200)
    #[serde(default = "default_lock_poll")]
    pub lock_poll_ms: u64,

    /// How long a request waits for a pool lock before giving up (default: 90)
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
}

impl ControllerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: default_lock_timeout(),
            lock_poll_ms: default_lock_poll(),
            lock_wait_secs: default_lock_wait(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpawnerConfig {
    /// Manager executable (default: poolmux-manager next to the running binary)
    pub manager_command: Option<String>,

    /// Arguments placed before the positional manager arguments
    #[serde(default)]
    pub manager_args: Vec<String>,

    /// Lowest port a backend may listen on (default: 9000)
    #[serde(default = "default_port_min")]
    pub port_min: u16,

    /// Highest port a backend may listen on (default: 9999)
    #[serde(default = "default_port_max")]
    pub port_max: u16,

    /// How long to wait for the manager's readiness line (default: 30)
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// How long the manager may take to go to the background after its line (default: 15)
    #[serde(default = "default_extra_grace")]
    pub extra_grace_secs: u64,
}

impl SpawnerConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn extra_grace(&self) -> Duration {
        Duration::from_secs(self.extra_grace_secs)
    }

    /// Resolve the manager executable
    pub fn manager_command(&self) -> PathBuf {
        if let Some(command) = &self.manager_command {
            return PathBuf::from(command);
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("poolmux-manager")))
            .unwrap_or_else(|| PathBuf::from("poolmux-manager"))
    }
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            manager_command: None,
            manager_args: Vec::new(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            readiness_timeout_secs: default_readiness_timeout(),
            extra_grace_secs: default_extra_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    /// Seconds between registrations (default: 30)
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// Lifetime of a registration in seconds (default: 90)
    #[serde(default = "default_heartbeat_ttl")]
    pub ttl_secs: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            ttl_secs: default_heartbeat_ttl(),
        }
    }
}

/// Configuration for the manager child and the backend it supervises
///
/// # Security Warning
///
/// `backend_command` and `backend_args` are executed directly by every
/// manager. Configuration files must be protected with appropriate file
/// permissions (e.g., readable only by the service user).
#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    /// Command that runs one pool's storage backend
    pub backend_command: Option<String>,

    /// Arguments for the backend; `{host}`, `{port}`, `{pool_id}` and
    /// `{directory}` are substituted
    #[serde(default)]
    pub backend_args: Vec<String>,

    /// How long a backend may take to accept connections (default: 30)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Seconds between checks of the backend (default: 30)
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,

    /// Idle time after which a backend is stopped (default: 600)
    #[serde(default = "default_keepalive_limit")]
    pub keepalive_limit_secs: u64,

    /// Extra lifetime of the process record beyond one watch interval (default: 30)
    #[serde(default = "default_record_ttl_margin")]
    pub record_ttl_margin_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 10)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// File the detached manager logs to; logs are discarded when unset
    pub log_file: Option<String>,
}

impl ManagerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    pub fn keepalive_limit(&self) -> Duration {
        Duration::from_secs(self.keepalive_limit_secs)
    }

    /// Lifetime of the process record between two refreshes
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs + self.record_ttl_margin_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backend_command: None,
            backend_args: Vec::new(),
            startup_timeout_secs: default_startup_timeout(),
            watch_interval_secs: default_watch_interval(),
            keepalive_limit_secs: default_keepalive_limit(),
            record_ttl_margin_secs: default_record_ttl_margin(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            log_file: None,
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8008
}

fn default_advertised_host() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8009
}

fn default_forwarding_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per upstream
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_connect_backoff() -> u64 {
    500
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_lock_timeout() -> u64 {
    60
}

fn default_lock_poll() -> u64 {
    200
}

fn default_lock_wait() -> u64 {
    90
}

fn default_port_min() -> u16 {
    9000
}

fn default_port_max() -> u16 {
    9999
}

fn default_readiness_timeout() -> u64 {
    30
}

fn default_extra_grace() -> u64 {
    15
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_ttl() -> u64 {
    90
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_watch_interval() -> u64 {
    30
}

fn default_keepalive_limit() -> u64 {
    600 // 10 minutes
}

fn default_record_ttl_margin() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
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

        if self.store.path.as_deref().map_or(true, |p| p.trim().is_empty()) {
            errors.push(
                "store.path must be set; managers record their backends in the shared store"
                    .to_string(),
            );
        }

        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }

        for addr in &self.server.trusted_proxies {
            if addr.parse::<IpAddr>().is_err() {
                errors.push(format!("server.trusted_proxies: '{}' is not an IP address", addr));
            }
        }

        if self.spawner.port_min == 0 {
            errors.push("spawner.port_min must be greater than 0".to_string());
        }

        if self.spawner.port_min > self.spawner.port_max {
            errors.push(format!(
                "spawner.port_min ({}) must not exceed spawner.port_max ({})",
                self.spawner.port_min, self.spawner.port_max
            ));
        }

        if self.heartbeat.interval_secs == 0 {
            errors.push("heartbeat.interval_secs must be at least 1".to_string());
        }

        // The next registration may come up to one interval plus jitter later
        let renew_bound = self.heartbeat.interval_secs + MAX_JITTER.as_secs();
        if self.heartbeat.ttl_secs <= renew_bound {
            errors.push(format!(
                "heartbeat.ttl_secs ({}) must be greater than heartbeat.interval_secs plus jitter ({})",
                self.heartbeat.ttl_secs, renew_bound
            ));
        }

        // A lock that expires while its holder is still spawning lets a second node in
        let spawn_bound = self.spawner.readiness_timeout_secs + self.spawner.extra_grace_secs;
        if self.controller.lock_timeout_secs < spawn_bound {
            errors.push(format!(
                "controller.lock_timeout_secs ({}) must cover spawner readiness timeout plus grace ({})",
                self.controller.lock_timeout_secs, spawn_bound
            ));
        }

        if self.controller.lock_poll_ms == 0 {
            errors.push("controller.lock_poll_ms must be greater than 0".to_string());
        }

        if let Some(command) = &self.manager.backend_command {
            if command.trim().is_empty() {
                errors.push("manager.backend_command must not be empty".to_string());
            }
        }

        if self.manager.watch_interval_secs == 0 {
            errors.push("manager.watch_interval_secs must be at least 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
