//! RemoteSession: one authenticated SSH connection to a Bjorn device.
//!
//! The session owns the connection handle and issues every remote command
//! through the [`SshConnector`] / [`SshConnection`] / [`ShellChannel`] ports,
//! implemented by `infrastructure::ssh` (libssh2) and by the scripted mock used
//! in tests.
//!
//! # Failure semantics
//!
//! - [`RemoteSession::connect`] never fails loudly: it returns `false` and
//!   emits an error [`Event::Log`].
//! - One-shot operations (`execute`, `upload`, ...) return `Result` and let
//!   the caller decide.
//! - The long-running loops (installation, log streaming) absorb faults into
//!   log events.  Only [`SessionError::NotConnected`] and
//!   [`SessionError::Busy`] propagate out of them.
//!
//! # Concurrency
//!
//! Methods take `&self` so a session can be shared with a worker thread.  At
//! most one operation runs at a time: a second concurrent call is rejected
//! with [`SessionError::Busy`] rather than queued.  [`RemoteSession::close`]
//! is never rejected.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::thread;
use std::time::Duration;

use bjorn_core::{Event, EventSink, LogLevel};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::channel_output::LineSplitter;

/// Private key file names tried, in order, when no explicit key is configured.
pub const DEFAULT_KEY_NAMES: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

/// Cadence of the non-blocking read loops.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes read from a channel per poll.
pub(crate) const READ_CHUNK: usize = 4096;

/// SSH keepalive interval requested after connecting.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Error type for remote session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An operation was attempted before `connect()` succeeded or after
    /// `close()`.
    #[error("SSH session is not connected")]
    NotConnected,

    /// Another operation is already running on this session.
    #[error("another operation is already running on this session")]
    Busy,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("cannot connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("no private key and no password available")]
    NoCredentials,
}

// ── Ports (implemented by infrastructure) ─────────────────────────────────────

/// Where to connect and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// One authentication attempt.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey {
        private_key: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

// Keeps secrets out of logs.
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey { private_key, .. } => {
                f.debug_struct("PublicKey").field("private_key", private_key).finish()
            }
            Self::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Result of a one-shot remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Opens authenticated connections.
pub trait SshConnector: Send + Sync {
    fn connect(
        &self,
        target: &SessionTarget,
        auth: &AuthMethod,
        timeout: Duration,
    ) -> Result<Box<dyn SshConnection>, SessionError>;
}

/// An authenticated connection able to open several channels.
pub trait SshConnection: Send {
    /// Runs `command` to completion, optionally feeding `stdin` first.
    fn exec(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, SessionError>;

    /// Starts `command` on a new channel and returns it without waiting.
    /// With `pty` set, a pseudo-terminal is requested first so prompts appear
    /// in the output stream.
    fn open_channel(&mut self, command: &str, pty: bool)
        -> Result<Box<dyn ShellChannel>, SessionError>;

    /// Copies a local file to `remote` over SFTP.
    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), SessionError>;

    /// Writes `contents` to `remote` over SFTP.
    fn write_file(&mut self, remote: &str, contents: &[u8]) -> Result<(), SessionError>;

    /// Creates a remote directory.  An existing directory is not an error.
    fn create_dir(&mut self, remote: &str) -> Result<(), SessionError>;

    /// Enables transport keepalives.
    fn set_keepalive(&mut self, interval: Duration);

    fn disconnect(&mut self);
}

/// A running remote command.  Dropping a channel releases it.
pub trait ShellChannel: Send {
    /// Copies whatever output is available into `buf` without blocking.
    /// Returns 0 when nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SessionError>;

    /// Writes `data` to the command's stdin.
    fn send(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Exit status, once the remote command has finished.
    fn exit_status(&mut self) -> Result<Option<i32>, SessionError>;

    fn close(&mut self);
}

// ── Session configuration and state ───────────────────────────────────────────

/// Connection parameters of one session.
#[derive(Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Login password.  Also used as key passphrase and as sudo password when
    /// no dedicated one is given.
    pub password: Option<String>,
    pub sudo_password: Option<String>,
    /// Explicit private key.  When set but missing, no key is tried.
    pub key_path: Option<PathBuf>,
    /// Directory searched for [`DEFAULT_KEY_NAMES`].
    pub ssh_dir: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Upload destination on the device.
    pub remote_dir: String,
    /// systemd unit of the device software.
    pub service_name: String,
}

impl SessionConfig {
    /// Defaults for a device at `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: "bjorn".to_string(),
            password: None,
            sudo_password: None,
            key_path: None,
            ssh_dir: default_ssh_dir(),
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            remote_dir: "/home/bjorn".to_string(),
            service_name: "bjorn.service".to_string(),
        }
    }

    pub fn target(&self) -> SessionTarget {
        SessionTarget {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
        }
    }

    /// The private key to try first, if any.
    pub fn resolve_key_path(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.key_path {
            return explicit.is_file().then(|| explicit.clone());
        }
        let dir = self.ssh_dir.as_ref()?;
        DEFAULT_KEY_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    /// Password written to `sudo -S`.
    pub fn sudo_password(&self) -> &str {
        self.sudo_password
            .as_deref()
            .or(self.password.as_deref())
            .unwrap_or("")
    }

    /// `remote_dir` without a trailing slash.
    pub fn remote_base(&self) -> &str {
        let trimmed = self.remote_dir.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }
}

// Keeps passwords out of logs.
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("has_password", &self.password.is_some())
            .field("has_sudo_password", &self.sudo_password.is_some())
            .field("key_path", &self.key_path)
            .field("remote_dir", &self.remote_dir)
            .field("service_name", &self.service_name)
            .finish()
    }
}

/// `~/.ssh` of the current user.
pub fn default_ssh_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".ssh"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationState {
    Idle,
    /// `step`/`total` are 0 until the first step marker arrives.
    Running { step: u32, total: u32 },
    Completed { success: bool },
}

// ── RemoteSession ─────────────────────────────────────────────────────────────

/// Clears the in-flight flag when the operation ends, on every path.
pub(crate) struct OperationGuard<'a>(&'a AtomicBool);

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// See the module docs.
pub struct RemoteSession {
    config: SessionConfig,
    connector: Arc<dyn SshConnector>,
    sink: Arc<dyn EventSink>,
    connection: Mutex<Option<Box<dyn SshConnection>>>,
    connection_state: Mutex<ConnectionState>,
    installation_state: Mutex<InstallationState>,
    in_flight: AtomicBool,
}

impl RemoteSession {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn SshConnector>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            connector,
            sink,
            connection: Mutex::new(None),
            connection_state: Mutex::new(ConnectionState::Disconnected),
            installation_state: Mutex::new(InstallationState::Idle),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.connection_state)
    }

    pub fn installation_state(&self) -> InstallationState {
        *lock(&self.installation_state)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.connection).is_some()
    }

    /// Connects and authenticates: key first, then password.
    ///
    /// Returns `false` on any failure, after emitting an error log event.
    /// An existing connection is closed first.
    pub fn connect(&self) -> bool {
        let Ok(_op) = self.begin_operation() else {
            self.log("[SSH] Another operation is in progress", LogLevel::Error);
            return false;
        };
        if let Some(mut old) = lock(&self.connection).take() {
            old.disconnect();
        }
        self.set_connection_state(ConnectionState::Connecting);

        let target = self.config.target();
        let timeout = self.config.connect_timeout;
        info!("connecting to {target}");

        let mut connection = None;
        if let Some(key) = self.config.resolve_key_path() {
            let auth = AuthMethod::PublicKey {
                private_key: key.clone(),
                passphrase: self.config.password.clone(),
            };
            match self.connector.connect(&target, &auth, timeout) {
                Ok(conn) => {
                    let name = key
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    self.log(&format!("[SSH] Connected via key: {name}"), LogLevel::Info);
                    connection = Some(conn);
                }
                Err(e) => {
                    debug!("key authentication with {} failed: {e}", key.display());
                    self.log(
                        "[SSH] Key auth failed, falling back to password",
                        LogLevel::Warning,
                    );
                }
            }
        }

        if connection.is_none() {
            let Some(password) = self.config.password.clone() else {
                self.log("[SSH] No password available for fallback auth", LogLevel::Error);
                self.set_connection_state(ConnectionState::Failed);
                return false;
            };
            match self
                .connector
                .connect(&target, &AuthMethod::Password(password), timeout)
            {
                Ok(conn) => {
                    self.log("[SSH] Connected via password", LogLevel::Info);
                    connection = Some(conn);
                }
                Err(e) => {
                    self.log(&format!("[SSH] Connection failed: {e}"), LogLevel::Error);
                    self.set_connection_state(ConnectionState::Failed);
                    return false;
                }
            }
        }

        let Some(mut conn) = connection else {
            self.set_connection_state(ConnectionState::Failed);
            return false;
        };
        conn.set_keepalive(KEEPALIVE_INTERVAL);
        *lock(&self.connection) = Some(conn);
        self.set_connection_state(ConnectionState::Connected);
        true
    }

    /// Runs `command` and waits for it, for at most `timeout`.
    pub fn execute(
        &self,
        command: &str,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, SessionError> {
        let _op = self.begin_operation()?;
        self.exec_unguarded(command, stdin, timeout)
    }

    /// Runs `sudo -S <command>`, writing the sudo password to stdin.
    pub fn execute_privileged(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SessionError> {
        let _op = self.begin_operation()?;
        self.exec_privileged_unguarded(command, timeout)
    }

    /// Uploads a local file over SFTP.
    pub fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let _op = self.begin_operation()?;
        self.upload_unguarded(local, remote)
    }

    /// Uploads `install_bjorn.sh` and every `lib/*.sh` fragment of
    /// `assets_dir` to the remote directory.  Returns the remote script path.
    pub fn upload_install_assets(&self, assets_dir: &Path) -> Result<String, SessionError> {
        let _op = self.begin_operation()?;
        let base = self.config.remote_base().to_string();

        let remote_script = remote_join(&base, "install_bjorn.sh");
        self.log("[SFTP] Uploading install_bjorn.sh", LogLevel::Info);
        self.with_connection(|c| c.upload(&assets_dir.join("install_bjorn.sh"), &remote_script))?;

        let remote_lib = remote_join(&base, "lib");
        if let Err(e) = self.with_connection(|c| c.create_dir(&remote_lib)) {
            if matches!(e, SessionError::NotConnected) {
                return Err(e);
            }
            debug!("mkdir {remote_lib}: {e} (assuming it exists)");
        }

        for fragment in shell_fragments(&assets_dir.join("lib"))? {
            let Some(name) = fragment.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            self.log(&format!("[SFTP] Uploading lib/{name}"), LogLevel::Info);
            let remote = remote_join(&remote_lib, &name);
            self.with_connection(|c| c.upload(&fragment, &remote))?;
        }

        self.log("[SFTP] All install scripts uploaded", LogLevel::Success);
        Ok(remote_script)
    }

    /// Follows the device service journal until `cancel` is set or the
    /// remote command exits.  Every non-empty line is emitted as
    /// `[BJORN] <line>`.
    pub fn stream_logs(&self, cancel: &AtomicBool) -> Result<(), SessionError> {
        let _op = self.begin_operation()?;
        let command = format!("journalctl -fu {}", shell_quote(&self.config.service_name));
        let mut channel = match self.with_connection(|c| c.open_channel(&command, false)) {
            Ok(channel) => channel,
            Err(SessionError::NotConnected) => return Err(SessionError::NotConnected),
            Err(e) => {
                self.log(&format!("Log streaming error: {e}"), LogLevel::Error);
                return Ok(());
            }
        };
        self.log("[LOGS] Starting log stream...", LogLevel::Info);

        if let Err(e) = self.follow(channel.as_mut(), cancel) {
            if !cancel.load(Ordering::SeqCst) {
                self.log(&format!("Log streaming error: {e}"), LogLevel::Error);
            }
        }
        channel.close();
        self.log("[LOGS] Log stream stopped", LogLevel::Info);
        Ok(())
    }

    fn follow(&self, channel: &mut dyn ShellChannel, cancel: &AtomicBool) -> Result<(), SessionError> {
        let mut buf = [0u8; READ_CHUNK];
        let mut lines = LineSplitter::default();
        while !cancel.load(Ordering::SeqCst) {
            let n = channel.read_available(&mut buf)?;
            if n > 0 {
                for line in lines.push(&buf[..n]) {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    self.emit_journal_line(&line);
                }
                continue;
            }
            if channel.exit_status()?.is_some() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        if let Some(rest) = lines.finish() {
            self.emit_journal_line(&rest);
        }
        Ok(())
    }

    fn emit_journal_line(&self, line: &str) {
        if !line.trim().is_empty() {
            self.sink.emit(Event::info(format!("[BJORN] {line}")));
        }
    }

    /// Drops the connection.  Safe to call repeatedly; emits one
    /// "Disconnected" warning when a connection was open.
    pub fn close(&self) {
        let previous = lock(&self.connection).take();
        if let Some(mut conn) = previous {
            conn.disconnect();
            self.set_connection_state(ConnectionState::Disconnected);
            self.log("[SSH] Disconnected.", LogLevel::Warning);
        }
    }

    // ── Crate-internal helpers used by the install/maintenance use cases ─────

    /// Marks an operation in flight, or fails with [`SessionError::Busy`].
    pub(crate) fn begin_operation(&self) -> Result<OperationGuard<'_>, SessionError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| OperationGuard(&self.in_flight))
            .map_err(|_| SessionError::Busy)
    }

    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut dyn SshConnection) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut guard = lock(&self.connection);
        let conn = guard.as_mut().ok_or(SessionError::NotConnected)?;
        f(conn.as_mut())
    }

    pub(crate) fn require_connected(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    pub(crate) fn exec_unguarded(
        &self,
        command: &str,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, SessionError> {
        debug!("exec: {command}");
        self.with_connection(|c| c.exec(command, stdin.map(str::as_bytes), timeout))
    }

    pub(crate) fn exec_privileged_unguarded(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SessionError> {
        let stdin = format!("{}\n", self.config.sudo_password());
        self.exec_unguarded(&format!("sudo -S {command}"), Some(&stdin), timeout)
    }

    pub(crate) fn upload_unguarded(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| local.display().to_string());
        self.log(&format!("[SFTP] Upload {name} -> {remote}"), LogLevel::Info);
        self.with_connection(|c| c.upload(local, remote))?;
        self.log("[SFTP] Upload complete.", LogLevel::Success);
        Ok(())
    }

    pub(crate) fn set_installation_state(&self, state: InstallationState) {
        *lock(&self.installation_state) = state;
    }

    pub(crate) fn emit(&self, event: Event) {
        self.sink.emit(event);
    }

    pub(crate) fn log(&self, message: &str, level: LogLevel) {
        match level {
            LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            _ => info!("{message}"),
        }
        self.sink.emit(Event::log(message, level));
    }

    fn set_connection_state(&self, state: ConnectionState) {
        *lock(&self.connection_state) = state;
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Quotes `s` for a POSIX shell.  NUL bytes cannot be passed through a
/// command line and are dropped.
pub(crate) fn shell_quote(s: &str) -> String {
    let cleaned = s.replace('\0', "");
    shlex::try_quote(&cleaned)
        .map(|q| q.into_owned())
        .unwrap_or_else(|_| "''".to_string())
}

fn remote_join(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// `*.sh` files directly inside `dir`, sorted by name.
fn shell_fragments(dir: &Path) -> Result<Vec<PathBuf>, SessionError> {
    let mut fragments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "sh") {
            fragments.push(path);
        }
    }
    fragments.sort();
    Ok(fragments)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
