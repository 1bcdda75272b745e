//! The manager child: starts one pool's backend and looks after it
//!
//! Invoked by the spawner as
//! `poolmux-manager <host> <gateway_port> <port_min> <port_max> <pool_id> --config <path> [--traceid <id>]`.
//! It detaches into its own session, starts the backend on a free port from
//! the range, writes the pool's process record, prints `host:port` and then
//! watches the backend until it exits, goes idle, or loses its record.

use crate::config::{Config, ManagerConfig};
use crate::error::StoreResult;
use crate::store::open_store;
use crate::tables::{Endpoint, PoolRecord, ProcessRecord, Tables};
use anyhow::{bail, Context};
use rand::seq::SliceRandom;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

/// Interval between readiness checks of a starting backend
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive failed store checks before the manager gives up
const MAX_STORE_FAILURES: u32 = 3;

/// Positional and flag arguments of the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerArgs {
    pub host: String,
    pub gateway_port: u16,
    pub port_min: u16,
    pub port_max: u16,
    pub pool_id: String,
    pub config_path: PathBuf,
    pub trace_id: Option<String>,
}

impl ManagerArgs {
    /// Parse arguments, without the program name
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut positional = Vec::new();
        let mut config_path = None;
        let mut trace_id = None;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--config=") {
                config_path = Some(value.to_string());
            } else if arg == "--config" {
                config_path = Some(args.next().context("--config requires a path")?);
            } else if let Some(value) = arg.strip_prefix("--traceid=") {
                trace_id = Some(value.to_string());
            } else if arg == "--traceid" {
                trace_id = Some(args.next().context("--traceid requires a value")?);
            } else if arg.starts_with("--") {
                bail!("unknown option {}", arg);
            } else {
                positional.push(arg);
            }
        }

        let [host, gateway_port, port_min, port_max, pool_id]: [String; 5] =
            positional.try_into().map_err(|given: Vec<String>| {
                anyhow::anyhow!(
                    "expected <host> <gateway_port> <port_min> <port_max> <pool_id>, got {} arguments",
                    given.len()
                )
            })?;

        let parsed = Self {
            host,
            gateway_port: gateway_port.parse().context("invalid gateway port")?,
            port_min: port_min.parse().context("invalid port_min")?,
            port_max: port_max.parse().context("invalid port_max")?,
            pool_id,
            config_path: PathBuf::from(config_path.context("--config is required")?),
            trace_id,
        };
        if parsed.port_min == 0 || parsed.port_min > parsed.port_max {
            bail!("invalid port range {}..{}", parsed.port_min, parsed.port_max);
        }
        Ok(parsed)
    }

    pub fn node(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.gateway_port)
    }
}

/// Substitute `{host}`, `{port}`, `{pool_id}` and `{directory}` in backend arguments
pub fn expand_backend_args(
    args: &[String],
    host: &str,
    port: u16,
    pool: &PoolRecord,
) -> Vec<String> {
    args.iter()
        .map(|arg| {
            arg.replace("{host}", host)
                .replace("{port}", &port.to_string())
                .replace("{pool_id}", &pool.pool_id)
                .replace("{directory}", &pool.buckets_directory)
        })
        .collect()
}

/// Whether a backend last used at `last_access` has been idle too long
pub fn is_idle(now: i64, last_access: i64, keepalive_limit: Duration) -> bool {
    now.saturating_sub(last_access) > keepalive_limit.as_secs() as i64
}

/// Why the watch loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    BackendExited(Option<i32>),
    /// The process record is gone or belongs to another manager
    LostOwnership,
    Idle,
    Terminated,
    StoreUnavailable,
}

enum Readiness {
    Listening,
    Exited(Option<i32>),
    TimedOut,
}

/// Fork into the background.
///
/// Returns `false` in the parent, which should exit 0 at once, and `true` in
/// the child, which is now the leader of a new session. Must be called before
/// any threads are started.
pub fn detach() -> anyhow::Result<bool> {
    // SAFETY: called while the process is single threaded
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error()).context("fork failed");
    }
    if pid > 0 {
        return Ok(false);
    }
    // SAFETY: setsid has no memory safety requirements
    if unsafe { libc::setsid() } < 0 {
        return Err(std::io::Error::last_os_error()).context("setsid failed");
    }
    Ok(true)
}

/// Point stdout and stderr at /dev/null so the spawner's pipes close
fn silence_stdio() -> anyhow::Result<()> {
    let devnull = std::fs::OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")?;
    for target in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call
        if unsafe { libc::dup2(devnull.as_raw_fd(), target) } < 0 {
            return Err(std::io::Error::last_os_error()).context("dup2 failed");
        }
    }
    Ok(())
}

/// Stop a backend: SIGTERM, then SIGKILL after the grace period
pub async fn stop_backend(child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to backend");
        // SAFETY: pid is our own child, not yet reaped
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "Backend process exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}

pub struct Manager {
    args: ManagerArgs,
    config: ManagerConfig,
    tables: Arc<Tables>,
}

impl Manager {
    pub fn new(args: ManagerArgs, config: ManagerConfig, tables: Arc<Tables>) -> Self {
        Self {
            args,
            config,
            tables,
        }
    }

    fn backend_command(&self, pool: &PoolRecord, port: u16) -> anyhow::Result<Command> {
        let command_line = self
            .config
            .backend_command
            .as_deref()
            .context("manager.backend_command is not configured")?;
        let mut words = shell_words::split(command_line).context("invalid manager.backend_command")?;
        if words.is_empty() {
            bail!("manager.backend_command is empty");
        }
        let program = words.remove(0);

        let mut cmd = Command::new(program);
        cmd.args(words);
        cmd.args(expand_backend_args(&self.config.backend_args, &self.args.host, port, pool));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    async fn poll_readiness(&self, child: &mut Child, port: u16, deadline: Instant) -> anyhow::Result<Readiness> {
        let address = Endpoint::new(self.args.host.clone(), port).to_string();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Readiness::Exited(status.code()));
            }
            if TcpStream::connect(&address).await.is_ok() {
                return Ok(Readiness::Listening);
            }
            if Instant::now() >= deadline {
                return Ok(Readiness::TimedOut);
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    /// Start the backend on the first port from the range that works
    pub async fn start_backend(&self, pool: &PoolRecord) -> anyhow::Result<(Child, u16)> {
        let mut ports: Vec<u16> = (self.args.port_min..=self.args.port_max).collect();
        ports.shuffle(&mut rand::thread_rng());
        let deadline = Instant::now() + self.config.startup_timeout();

        for port in ports {
            if Instant::now() >= deadline {
                break;
            }
            let mut child = self.backend_command(pool, port)?.spawn().context("failed to start backend")?;
            debug!(pool_id = %pool.pool_id, port, pid = ?child.id(), "Backend launched");

            match self.poll_readiness(&mut child, port, deadline).await? {
                Readiness::Listening => {
                    info!(pool_id = %pool.pool_id, port, "Backend is listening");
                    return Ok((child, port));
                }
                Readiness::Exited(code) => {
                    debug!(pool_id = %pool.pool_id, port, ?code, "Backend exited, trying another port");
                }
                Readiness::TimedOut => {
                    stop_backend(&mut child, self.config.shutdown_grace_period()).await;
                    break;
                }
            }
        }

        bail!(
            "backend for pool {} did not start within {} seconds",
            pool.pool_id,
            self.config.startup_timeout_secs
        )
    }

    /// Record the running backend and reset its idle clock.
    ///
    /// Returns `None` when another manager already holds the pool's record.
    pub fn claim(&self, port: u16, backend_pid: Option<u32>) -> StoreResult<Option<ProcessRecord>> {
        let now = chrono::Utc::now().timestamp();
        let record = ProcessRecord {
            mux_host: self.args.host.clone(),
            mux_port: self.args.gateway_port,
            backend_host: self.args.host.clone(),
            backend_port: port,
            manager_pid: std::process::id(),
            backend_pid,
            started_at: now,
        };
        if !self
            .tables
            .claim_process(&self.args.pool_id, &record, self.config.record_ttl())?
        {
            return Ok(None);
        }
        self.tables.set_access_time(&self.args.pool_id, now)?;
        Ok(Some(record))
    }

    /// One watch step: a reason to stop, or `None` after refreshing the record
    pub fn check(&self, record: &ProcessRecord, now: i64) -> StoreResult<Option<StopReason>> {
        let pool_id = &self.args.pool_id;
        match self.tables.get_process(pool_id)? {
            Some(current) if current == *record => {}
            _ => return Ok(Some(StopReason::LostOwnership)),
        }

        let last_access = self
            .tables
            .get_access_time(pool_id)?
            .unwrap_or(record.started_at);
        if is_idle(now, last_access, self.config.keepalive_limit()) {
            return Ok(Some(StopReason::Idle));
        }

        self.tables.refresh_process(pool_id, self.config.record_ttl())?;
        Ok(None)
    }

    async fn watch(&self, child: &mut Child, record: &ProcessRecord) -> anyhow::Result<StopReason> {
        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut failures = 0;

        loop {
            tokio::select! {
                status = child.wait() => {
                    return Ok(StopReason::BackendExited(status.ok().and_then(|s| s.code())));
                }
                _ = sigterm.recv() => {
                    return Ok(StopReason::Terminated);
                }
                _ = tokio::time::sleep(self.config.watch_interval()) => {
                    match self.check(record, chrono::Utc::now().timestamp()) {
                        Ok(None) => failures = 0,
                        Ok(Some(reason)) => return Ok(reason),
                        Err(e) => {
                            failures += 1;
                            warn!(pool_id = %self.args.pool_id, failures, error = %e, "Table store check failed");
                            if failures >= MAX_STORE_FAILURES {
                                return Ok(StopReason::StoreUnavailable);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Remove the process record if it is still ours
    pub fn release(&self, record: &ProcessRecord) -> StoreResult<bool> {
        match self.tables.get_process(&self.args.pool_id)? {
            Some(current) if current == *record => self.tables.delete_process(&self.args.pool_id),
            _ => Ok(false),
        }
    }

    /// Start, announce and supervise the backend until it should stop
    pub async fn run(&self) -> anyhow::Result<()> {
        let pool_id = &self.args.pool_id;
        let trace_id = self.args.trace_id.as_deref().unwrap_or("-");

        if let Some(existing) = self.tables.get_process(pool_id)? {
            info!(trace_id, pool_id = %pool_id, node = %existing.mux_endpoint(), "Pool already running, nothing to do");
            return Ok(());
        }
        let pool = self
            .tables
            .get_pool(pool_id)?
            .with_context(|| format!("unknown pool {}", pool_id))?;

        let (mut child, port) = self.start_backend(&pool).await?;
        let Some(record) = self.claim(port, child.id())? else {
            info!(trace_id, pool_id = %pool_id, "Pool claimed by another manager, stopping our backend");
            stop_backend(&mut child, self.config.shutdown_grace_period()).await;
            return Ok(());
        };

        {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", record.backend_endpoint())?;
            stdout.flush()?;
        }
        silence_stdio()?;
        info!(trace_id, pool_id = %pool_id, backend = %record.backend_endpoint(), "Backend announced");

        let reason = match self.watch(&mut child, &record).await {
            Ok(reason) => reason,
            Err(e) => {
                error!(pool_id = %pool_id, error = %e, "Watch loop failed");
                StopReason::Terminated
            }
        };
        info!(pool_id = %pool_id, reason = ?reason, "Stopping backend");

        if let Err(e) = self.release(&record) {
            warn!(pool_id = %pool_id, error = %e, "Failed to remove process record");
        }
        if !matches!(reason, StopReason::BackendExited(_)) {
            stop_backend(&mut child, self.config.shutdown_grace_period()).await;
        }
        Ok(())
    }
}

/// Entry point once detached: open the store and run the manager
pub async fn run(args: ManagerArgs, config: Config) -> anyhow::Result<()> {
    let store = open_store(&config.store).await?;
    let tables = Arc::new(Tables::new(store));
    Manager::new(args, config.manager, tables).run().await
}
