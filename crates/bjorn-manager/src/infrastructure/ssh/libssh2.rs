//! SSH transport on top of libssh2 (the `ssh2` crate).
//!
//! libssh2 sessions are blocking by default.  One-shot commands and SFTP
//! transfers run in blocking mode under a session timeout; channel reads for
//! the interactive loops switch the session to non-blocking mode for the
//! duration of a single read so they never stall.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ssh2::{Channel, ErrorCode, ExtendedData, Session};
use tracing::{debug, info};

use crate::application::remote_session::{
    AuthMethod, CommandOutput, SessionError, SessionTarget, ShellChannel, SshConnection,
    SshConnector,
};

/// `LIBSSH2_ERROR_TIMEOUT`.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Terminal type requested for PTY channels.
const PTY_TERM: &str = "xterm";

fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

fn ssh_error(e: ssh2::Error, timeout: Duration) -> SessionError {
    if e.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) {
        SessionError::Timeout(timeout)
    } else {
        SessionError::Channel(e.to_string())
    }
}

fn io_error(e: io::Error, timeout: Duration) -> SessionError {
    if e.kind() == io::ErrorKind::TimedOut {
        SessionError::Timeout(timeout)
    } else {
        SessionError::Io(e)
    }
}

/// Opens connections with libssh2 over a plain TCP stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct Libssh2Connector;

impl Libssh2Connector {
    pub fn new() -> Self {
        Self
    }
}

impl SshConnector for Libssh2Connector {
    fn connect(
        &self,
        target: &SessionTarget,
        auth: &AuthMethod,
        timeout: Duration,
    ) -> Result<Box<dyn SshConnection>, SessionError> {
        let connect_error = |reason: String| SessionError::Connect {
            target: target.to_string(),
            reason,
        };

        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| connect_error(e.to_string()))?
            .next()
            .ok_or_else(|| connect_error("host name did not resolve".to_string()))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| connect_error(e.to_string()))?;

        let mut session = Session::new().map_err(|e| connect_error(e.to_string()))?;
        session.set_timeout(millis(timeout));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| connect_error(format!("handshake failed: {e}")))?;

        let outcome = match auth {
            AuthMethod::PublicKey {
                private_key,
                passphrase,
            } => session.userauth_pubkey_file(&target.user, None, private_key, passphrase.as_deref()),
            AuthMethod::Password(password) => session.userauth_password(&target.user, password),
        };
        outcome.map_err(|e| SessionError::Auth(e.to_string()))?;
        if !session.authenticated() {
            return Err(SessionError::Auth(format!("{target} did not accept the credentials")));
        }

        info!("SSH session established with {target}");
        Ok(Box::new(Libssh2Connection {
            session,
            io_timeout: timeout,
        }))
    }
}

struct Libssh2Connection {
    session: Session,
    /// Applied to SFTP transfers.
    io_timeout: Duration,
}

impl Libssh2Connection {
    /// Runs `f` with the session timeout set to `timeout`, then clears it so
    /// interactive channels are not cut off.
    fn with_timeout<T>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        self.session.set_blocking(true);
        self.session.set_timeout(millis(timeout));
        let result = f(&self.session);
        self.session.set_timeout(0);
        result
    }
}

impl SshConnection for Libssh2Connection {
    fn exec(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, SessionError> {
        self.with_timeout(timeout, |session| {
            let mut channel = session.channel_session().map_err(|e| ssh_error(e, timeout))?;
            channel.exec(command).map_err(|e| ssh_error(e, timeout))?;
            if let Some(input) = stdin {
                channel.write_all(input).map_err(|e| io_error(e, timeout))?;
                channel.flush().map_err(|e| io_error(e, timeout))?;
            }
            channel.send_eof().map_err(|e| ssh_error(e, timeout))?;

            let mut stdout = Vec::new();
            channel
                .read_to_end(&mut stdout)
                .map_err(|e| io_error(e, timeout))?;
            let mut stderr = Vec::new();
            channel
                .stderr()
                .read_to_end(&mut stderr)
                .map_err(|e| io_error(e, timeout))?;
            channel.wait_close().map_err(|e| ssh_error(e, timeout))?;
            let exit_code = channel.exit_status().map_err(|e| ssh_error(e, timeout))?;

            Ok(CommandOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
    }

    fn open_channel(
        &mut self,
        command: &str,
        pty: bool,
    ) -> Result<Box<dyn ShellChannel>, SessionError> {
        let timeout = self.io_timeout;
        let channel = self.with_timeout(timeout, |session| {
            let mut channel = session.channel_session().map_err(|e| ssh_error(e, timeout))?;
            if pty {
                channel
                    .request_pty(PTY_TERM, None, None)
                    .map_err(|e| ssh_error(e, timeout))?;
            } else {
                channel
                    .handle_extended_data(ExtendedData::Merge)
                    .map_err(|e| ssh_error(e, timeout))?;
            }
            channel.exec(command).map_err(|e| ssh_error(e, timeout))?;
            Ok(channel)
        })?;
        debug!("channel opened (pty={pty}): {command}");
        Ok(Box::new(Libssh2Channel {
            session: self.session.clone(),
            channel,
            exit_code: None,
        }))
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let transfer_error = |reason: String| SessionError::Transfer {
            path: local.display().to_string(),
            reason,
        };
        let mut source = File::open(local).map_err(|e| transfer_error(e.to_string()))?;
        let timeout = self.io_timeout;
        self.with_timeout(timeout, |session| {
            let sftp = session.sftp().map_err(|e| transfer_error(e.to_string()))?;
            let mut dest = sftp
                .create(Path::new(remote))
                .map_err(|e| transfer_error(format!("{remote}: {e}")))?;
            io::copy(&mut source, &mut dest).map_err(|e| transfer_error(e.to_string()))?;
            Ok(())
        })
    }

    fn write_file(&mut self, remote: &str, contents: &[u8]) -> Result<(), SessionError> {
        let transfer_error = |reason: String| SessionError::Transfer {
            path: remote.to_string(),
            reason,
        };
        let timeout = self.io_timeout;
        self.with_timeout(timeout, |session| {
            let sftp = session.sftp().map_err(|e| transfer_error(e.to_string()))?;
            let mut dest = sftp
                .create(Path::new(remote))
                .map_err(|e| transfer_error(e.to_string()))?;
            dest.write_all(contents)
                .map_err(|e| transfer_error(e.to_string()))
        })
    }

    fn create_dir(&mut self, remote: &str) -> Result<(), SessionError> {
        let timeout = self.io_timeout;
        self.with_timeout(timeout, |session| {
            let sftp = session.sftp().map_err(|e| ssh_error(e, timeout))?;
            let path = Path::new(remote);
            match sftp.mkdir(path, 0o755) {
                Ok(()) => Ok(()),
                Err(_) if sftp.stat(path).is_ok_and(|s| s.is_dir()) => Ok(()),
                Err(e) => Err(SessionError::Transfer {
                    path: remote.to_string(),
                    reason: e.to_string(),
                }),
            }
        })
    }

    fn set_keepalive(&mut self, interval: Duration) {
        let secs = u32::try_from(interval.as_secs()).unwrap_or(u32::MAX);
        self.session.set_keepalive(true, secs);
    }

    fn disconnect(&mut self) {
        self.session.set_blocking(true);
        self.session.set_timeout(1_000);
        if let Err(e) = self.session.disconnect(None, "session closed", None) {
            debug!("SSH disconnect: {e}");
        }
    }
}

struct Libssh2Channel {
    /// Shares the connection's transport; used to toggle blocking mode.
    session: Session,
    channel: Channel,
    exit_code: Option<i32>,
}

impl ShellChannel for Libssh2Channel {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        self.session.set_blocking(false);
        let result = self.channel.read(buf);
        self.session.set_blocking(true);
        match result {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.session.set_blocking(true);
        self.channel.write_all(data)?;
        self.channel.flush()?;
        Ok(())
    }

    fn exit_status(&mut self) -> Result<Option<i32>, SessionError> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        if !self.channel.eof() {
            return Ok(None);
        }
        self.session.set_blocking(true);
        self.channel
            .wait_close()
            .map_err(|e| SessionError::Channel(e.to_string()))?;
        let code = self
            .channel
            .exit_status()
            .map_err(|e| SessionError::Channel(e.to_string()))?;
        self.exit_code = Some(code);
        Ok(Some(code))
    }

    fn close(&mut self) {
        self.session.set_blocking(true);
        if let Err(e) = self.channel.close() {
            debug!("closing channel: {e}");
        }
    }
}
