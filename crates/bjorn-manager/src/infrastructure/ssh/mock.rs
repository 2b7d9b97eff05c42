//! Scripted SSH connector for tests.
//!
//! Lets unit and integration tests drive a [`RemoteSession`] without a
//! device: authentication outcomes, command results and channel output are
//! configured up front, and everything the session sends is recorded.
//!
//! [`RemoteSession`]: crate::application::remote_session::RemoteSession

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::application::remote_session::{
    AuthMethod, CommandOutput, SessionError, SessionTarget, ShellChannel, SshConnection,
    SshConnector,
};

#[derive(Default)]
struct MockState {
    accepted_password: Option<String>,
    accept_keys: bool,
    unreachable: bool,
    output: Vec<Vec<u8>>,
    exit_status: Option<i32>,
    channel_error: Option<String>,
    exec_results: Vec<(String, Result<CommandOutput, String>)>,

    auth_attempts: Vec<AuthMethod>,
    commands: Vec<(String, Option<String>)>,
    channel_commands: Vec<(String, bool)>,
    channel_writes: Vec<Vec<u8>>,
    uploads: Vec<(PathBuf, String)>,
    written_files: Vec<(String, Vec<u8>)>,
    created_dirs: Vec<String>,
    keepalive: Option<Duration>,
    disconnects: usize,
}

/// A [`SshConnector`] whose behavior is scripted by the test.
///
/// Clones share state, so a test can keep one handle for assertions while
/// the session owns another.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// Rejects every authentication attempt until configured otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Password authentication succeeds with exactly `password`.
    pub fn accept_password(self, password: &str) -> Self {
        self.state.lock().expect("lock poisoned").accepted_password = Some(password.to_string());
        self
    }

    /// Key authentication succeeds with any key.
    pub fn accept_key(self) -> Self {
        self.state.lock().expect("lock poisoned").accept_keys = true;
        self
    }

    /// Every connection attempt fails as if the host were down.
    pub fn unreachable(self) -> Self {
        self.state.lock().expect("lock poisoned").unreachable = true;
        self
    }

    /// Output chunks returned, one per read, by every opened channel.
    pub fn with_output(self, chunks: &[&str]) -> Self {
        self.state.lock().expect("lock poisoned").output =
            chunks.iter().map(|c| c.as_bytes().to_vec()).collect();
        self
    }

    /// Exit status reported once a channel's output is exhausted.  Without
    /// it, channels run until closed.
    pub fn with_exit_status(self, code: i32) -> Self {
        self.state.lock().expect("lock poisoned").exit_status = Some(code);
        self
    }

    /// Opening a channel fails with a channel error carrying `reason`.
    pub fn with_channel_error(self, reason: &str) -> Self {
        self.state.lock().expect("lock poisoned").channel_error = Some(reason.to_string());
        self
    }

    /// Result of one-shot commands starting with `prefix`.  Unmatched
    /// commands succeed with empty output.
    pub fn with_exec_result(self, prefix: &str, code: i32, stdout: &str, stderr: &str) -> Self {
        let output = CommandOutput {
            exit_code: code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
        self.state
            .lock()
            .expect("lock poisoned")
            .exec_results
            .push((prefix.to_string(), Ok(output)));
        self
    }

    /// One-shot commands starting with `prefix` fail with a channel error.
    pub fn with_exec_error(self, prefix: &str) -> Self {
        self.state
            .lock()
            .expect("lock poisoned")
            .exec_results
            .push((prefix.to_string(), Err("connection reset".to_string())));
        self
    }

    pub fn auth_attempts(&self) -> Vec<AuthMethod> {
        self.state.lock().expect("lock poisoned").auth_attempts.clone()
    }

    /// One-shot commands with their stdin, in order.
    pub fn commands(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().expect("lock poisoned").commands.clone()
    }

    pub fn channel_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .channel_commands
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Whether each opened channel requested a PTY.
    pub fn channel_ptys(&self) -> Vec<bool> {
        self.state
            .lock()
            .expect("lock poisoned")
            .channel_commands
            .iter()
            .map(|(_, pty)| *pty)
            .collect()
    }

    /// Everything written to channel stdin, one entry per write.
    pub fn channel_writes(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .channel_writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().expect("lock poisoned").uploads.clone()
    }

    pub fn written_files(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().expect("lock poisoned").written_files.clone()
    }

    pub fn created_dirs(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").created_dirs.clone()
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.state.lock().expect("lock poisoned").keepalive
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().expect("lock poisoned").disconnects
    }
}

impl SshConnector for MockConnector {
    fn connect(
        &self,
        target: &SessionTarget,
        auth: &AuthMethod,
        _timeout: Duration,
    ) -> Result<Box<dyn SshConnection>, SessionError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.auth_attempts.push(auth.clone());
        if state.unreachable {
            return Err(SessionError::Connect {
                target: target.to_string(),
                reason: "no route to host".to_string(),
            });
        }
        let accepted = match auth {
            AuthMethod::PublicKey { .. } => state.accept_keys,
            AuthMethod::Password(pw) => state.accepted_password.as_deref() == Some(pw.as_str()),
        };
        if !accepted {
            return Err(SessionError::Auth(format!("{target} rejected credentials")));
        }
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl SshConnection for MockConnection {
    fn exec(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        _timeout: Duration,
    ) -> Result<CommandOutput, SessionError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.commands.push((
            command.to_string(),
            stdin.map(|s| String::from_utf8_lossy(s).into_owned()),
        ));
        let scripted = state
            .exec_results
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone());
        match scripted {
            Some(Ok(output)) => Ok(output),
            Some(Err(reason)) => Err(SessionError::Channel(reason)),
            None => Ok(CommandOutput::default()),
        }
    }

    fn open_channel(
        &mut self,
        command: &str,
        pty: bool,
    ) -> Result<Box<dyn ShellChannel>, SessionError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.channel_commands.push((command.to_string(), pty));
        if let Some(reason) = &state.channel_error {
            return Err(SessionError::Channel(reason.clone()));
        }
        Ok(Box::new(MockChannel {
            state: Arc::clone(&self.state),
            pending: state.output.iter().cloned().collect(),
            exit_status: state.exit_status,
        }))
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), SessionError> {
        if !local.is_file() {
            return Err(SessionError::Transfer {
                path: local.display().to_string(),
                reason: "local file not found".to_string(),
            });
        }
        self.state
            .lock()
            .expect("lock poisoned")
            .uploads
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    fn write_file(&mut self, remote: &str, contents: &[u8]) -> Result<(), SessionError> {
        self.state
            .lock()
            .expect("lock poisoned")
            .written_files
            .push((remote.to_string(), contents.to_vec()));
        Ok(())
    }

    fn create_dir(&mut self, remote: &str) -> Result<(), SessionError> {
        self.state
            .lock()
            .expect("lock poisoned")
            .created_dirs
            .push(remote.to_string());
        Ok(())
    }

    fn set_keepalive(&mut self, interval: Duration) {
        self.state.lock().expect("lock poisoned").keepalive = Some(interval);
    }

    fn disconnect(&mut self) {
        self.state.lock().expect("lock poisoned").disconnects += 1;
    }
}

struct MockChannel {
    state: Arc<Mutex<MockState>>,
    pending: VecDeque<Vec<u8>>,
    exit_status: Option<i32>,
}

impl ShellChannel for MockChannel {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let Some(mut chunk) = self.pending.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.pending.push_front(chunk.split_off(n));
        }
        Ok(n)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.state
            .lock()
            .expect("lock poisoned")
            .channel_writes
            .push(data.to_vec());
        Ok(())
    }

    fn exit_status(&mut self) -> Result<Option<i32>, SessionError> {
        if self.pending.is_empty() {
            Ok(self.exit_status)
        } else {
            Ok(None)
        }
    }

    fn close(&mut self) {}
}
