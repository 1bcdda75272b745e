//! Launching manager children and waiting for their readiness line
//!
//! A manager child is started with the node's address, the backend port range
//! and the pool id. Once its backend listens and its process record is
//! written it prints one line `host:port` and goes to the background, so the
//! direct child exits 0 shortly after. Supervision of one child runs through
//! [`SpawnPhase`]: `Starting`, `AwaitingHandshake` (bounded by the readiness
//! timeout), `Detaching` (bounded by the extra grace), then `Done` or
//! `Failed`.

use crate::config::SpawnerConfig;
use crate::tables::Endpoint;
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Variables passed through to the child; everything else is dropped
const PASSED_ENV: &[&str] = &[
    "HOME", "LANG", "LC_CTYPE", "LOGNAME", "PATH", "SHELL", "USER", "USERNAME", "RUST_LOG",
];

/// Captured output kept per stream
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// How long to wait for output readers once the child is settled.
/// A detached grandchild may keep the pipes open indefinitely.
const CAPTURE_WAIT: Duration = Duration::from_millis(250);

/// Starts a backend for a pool on this node.
///
/// The controller is generic over this so tests can substitute a fake.
pub trait BackendSpawner: Send + Sync {
    /// Start a backend for `pool_id` and return its endpoint, or `None` on
    /// any failure. Failures are logged, never retried.
    fn start_spawner(
        &self,
        trace_id: Option<&str>,
        pool_id: &str,
    ) -> impl Future<Output = Option<Endpoint>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPhase {
    Starting,
    AwaitingHandshake,
    Detaching,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The child could not be started at all
    Launch(String),
    /// Standard output closed without a readiness line
    NoHandshake,
    /// No readiness line within the readiness timeout
    HandshakeTimeout,
    /// The readiness line is not `host:port`
    BadHandshake(String),
    /// The child exited unsuccessfully
    BadExit(Option<i32>),
    /// The child was still running after the extra grace
    StayedForeground,
    /// Waiting for the child failed
    Wait(String),
}

/// Outcome of supervising one child
#[derive(Debug)]
pub struct SpawnReport {
    pub phase: SpawnPhase,
    pub endpoint: Option<Endpoint>,
    pub failure: Option<SpawnFailure>,
    pub exit_status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    /// Every phase the supervision went through, in order
    pub history: Vec<SpawnPhase>,
}

impl SpawnReport {
    pub fn is_success(&self) -> bool {
        self.phase == SpawnPhase::Done
    }
}

/// Parse a readiness line such as `10.0.0.5:9012` or `[::1]:9012`
pub fn parse_readiness_line(line: &str) -> Result<Endpoint, crate::error::HandshakeError> {
    line.trim().parse()
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn append(&self, bytes: &[u8]) {
        let mut buf = self.0.lock();
        let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
        buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).trim_end().to_string()
    }
}

/// Copy a stream into `capture`, handing the first line to `first_line`
async fn drain<R: AsyncRead + Unpin>(
    mut stream: R,
    capture: Capture,
    mut first_line: Option<oneshot::Sender<String>>,
) {
    let mut chunk = [0u8; 4096];
    let mut pending = Vec::new();

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        capture.append(&chunk[..n]);

        if first_line.is_some() {
            pending.extend_from_slice(&chunk[..n]);
            if let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line = String::from_utf8_lossy(&pending[..pos]).into_owned();
                if let Some(tx) = first_line.take() {
                    let _ = tx.send(line);
                }
            }
        }
    }

    // an unterminated last line still counts
    if let Some(tx) = first_line.take() {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
        }
    }
}

async fn settle(mut reader: JoinHandle<()>) {
    if tokio::time::timeout(CAPTURE_WAIT, &mut reader).await.is_err() {
        reader.abort();
    }
}

/// Drives one child through the spawn phases
pub struct ChildSupervisor {
    readiness_timeout: Duration,
    extra_grace: Duration,
    phase: SpawnPhase,
    history: Vec<SpawnPhase>,
}

impl ChildSupervisor {
    pub fn new(readiness_timeout: Duration, extra_grace: Duration) -> Self {
        Self {
            readiness_timeout,
            extra_grace,
            phase: SpawnPhase::Starting,
            history: vec![SpawnPhase::Starting],
        }
    }

    pub fn phase(&self) -> SpawnPhase {
        self.phase
    }

    fn advance(&mut self, next: SpawnPhase) {
        debug!(from = ?self.phase, to = ?next, "Spawn phase");
        self.phase = next;
        self.history.push(next);
    }

    /// Run `cmd` to completion of the handshake.
    ///
    /// Never takes longer than the readiness timeout plus the extra grace,
    /// plus a short bounded wait for the output readers.
    pub async fn supervise(mut self, mut cmd: Command) -> SpawnReport {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.advance(SpawnPhase::Failed);
                return self.report(None, Some(SpawnFailure::Launch(e.to_string())), None, String::new(), String::new());
            }
        };
        debug!(pid = ?child.id(), "Manager process spawned");

        let stdout_capture = Capture::default();
        let stderr_capture = Capture::default();
        let (line_tx, line_rx) = oneshot::channel();

        let stdout_reader = match child.stdout.take() {
            Some(stdout) => tokio::spawn(drain(stdout, stdout_capture.clone(), Some(line_tx))),
            None => tokio::spawn(async {}),
        };
        let stderr_reader = match child.stderr.take() {
            Some(stderr) => tokio::spawn(drain(stderr, stderr_capture.clone(), None)),
            None => tokio::spawn(async {}),
        };

        self.advance(SpawnPhase::AwaitingHandshake);
        let handshake = match tokio::time::timeout(self.readiness_timeout, line_rx).await {
            Ok(Ok(line)) => {
                parse_readiness_line(&line).map_err(|e| SpawnFailure::BadHandshake(e.to_string()))
            }
            Ok(Err(_)) => Err(SpawnFailure::NoHandshake),
            Err(_) => Err(SpawnFailure::HandshakeTimeout),
        };

        self.advance(SpawnPhase::Detaching);
        let exit = self.reap(child).await;

        settle(stdout_reader).await;
        settle(stderr_reader).await;
        let stdout = stdout_capture.text();
        let stderr = stderr_capture.text();

        let (endpoint, failure, status) = match (handshake, exit) {
            (Err(failure), Ok(status)) => (None, Some(failure), status),
            (Err(failure), Err(_)) => (None, Some(failure), None),
            (Ok(endpoint), Ok(Some(status))) if status.success() => (Some(endpoint), None, Some(status)),
            (Ok(_), Ok(Some(status))) => (None, Some(SpawnFailure::BadExit(status.code())), Some(status)),
            (Ok(_), Ok(None)) => (None, Some(SpawnFailure::StayedForeground), None),
            (Ok(_), Err(failure)) => (None, Some(failure), None),
        };

        self.advance(if failure.is_none() {
            SpawnPhase::Done
        } else {
            SpawnPhase::Failed
        });
        self.report(endpoint, failure, status, stdout, stderr)
    }

    /// Wait for the direct child to exit within the extra grace.
    ///
    /// `Ok(None)` means it is still running; it is then killed and reaped in
    /// the background.
    async fn reap(&self, mut child: Child) -> Result<Option<ExitStatus>, SpawnFailure> {
        match tokio::time::timeout(self.extra_grace, child.wait()).await {
            Ok(Ok(status)) => Ok(Some(status)),
            Ok(Err(e)) => Err(SpawnFailure::Wait(e.to_string())),
            Err(_) => {
                let pid = child.id();
                if let Err(e) = child.start_kill() {
                    warn!(pid = ?pid, error = %e, "Failed to kill manager process");
                }
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                Ok(None)
            }
        }
    }

    fn report(
        self,
        endpoint: Option<Endpoint>,
        failure: Option<SpawnFailure>,
        exit_status: Option<ExitStatus>,
        stdout: String,
        stderr: String,
    ) -> SpawnReport {
        SpawnReport {
            phase: self.phase,
            endpoint,
            failure,
            exit_status,
            stdout,
            stderr,
            history: self.history,
        }
    }
}

/// Starts manager children on the local node
pub struct Spawner {
    node: Endpoint,
    manager_command: PathBuf,
    manager_args: Vec<String>,
    port_min: u16,
    port_max: u16,
    config_path: PathBuf,
    readiness_timeout: Duration,
    extra_grace: Duration,
}

impl Spawner {
    /// `node` is this gateway's advertised endpoint; `config_path` is handed
    /// to the manager so it reads the same configuration
    pub fn new(node: Endpoint, config: &SpawnerConfig, config_path: impl Into<PathBuf>) -> Self {
        Self {
            node,
            manager_command: config.manager_command(),
            manager_args: config.manager_args.clone(),
            port_min: config.port_min,
            port_max: config.port_max,
            config_path: config_path.into(),
            readiness_timeout: config.readiness_timeout(),
            extra_grace: config.extra_grace(),
        }
    }

    /// Arguments for the manager: configured prefix, then the positional protocol
    pub fn command_args(&self, trace_id: Option<&str>, pool_id: &str) -> Vec<String> {
        let mut args = self.manager_args.clone();
        args.extend([
            self.node.host.clone(),
            self.node.port.to_string(),
            self.port_min.to_string(),
            self.port_max.to_string(),
            pool_id.to_string(),
            "--config".to_string(),
            self.config_path.display().to_string(),
        ]);
        if let Some(trace_id) = trace_id {
            args.push("--traceid".to_string());
            args.push(trace_id.to_string());
        }
        args
    }

    fn command(&self, trace_id: Option<&str>, pool_id: &str) -> Command {
        let mut cmd = Command::new(&self.manager_command);
        cmd.args(self.command_args(trace_id, pool_id));
        cmd.env_clear();
        for name in PASSED_ENV {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
        cmd
    }

    /// Launch a manager and supervise it through the handshake
    pub async fn spawn_manager(&self, trace_id: Option<&str>, pool_id: &str) -> SpawnReport {
        info!(
            trace_id = trace_id.unwrap_or("-"),
            pool_id = %pool_id,
            command = %self.manager_command.display(),
            "Starting a manager"
        );
        ChildSupervisor::new(self.readiness_timeout, self.extra_grace)
            .supervise(self.command(trace_id, pool_id))
            .await
    }
}

impl BackendSpawner for Spawner {
    async fn start_spawner(&self, trace_id: Option<&str>, pool_id: &str) -> Option<Endpoint> {
        let report = self.spawn_manager(trace_id, pool_id).await;
        let trace_id = trace_id.unwrap_or("-");

        match (&report.endpoint, &report.failure) {
            (Some(endpoint), None) => {
                info!(trace_id, pool_id = %pool_id, endpoint = %endpoint, "Manager started a backend");
                if !report.stderr.is_empty() {
                    debug!(trace_id, pool_id = %pool_id, stderr = %report.stderr, "Output from a manager");
                }
                Some(endpoint.clone())
            }
            (_, Some(SpawnFailure::StayedForeground)) => {
                error!(
                    trace_id,
                    pool_id = %pool_id,
                    stdout = %report.stdout,
                    stderr = %report.stderr,
                    "Manager may not go background"
                );
                None
            }
            (_, failure) => {
                warn!(
                    trace_id,
                    pool_id = %pool_id,
                    failure = ?failure,
                    exit_status = ?report.exit_status,
                    stdout = %report.stdout,
                    stderr = %report.stderr,
                    "Starting a manager failed"
                );
                None
            }
        }
    }
}
