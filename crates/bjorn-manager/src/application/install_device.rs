//! InstallDeviceUseCase: runs the Bjorn installer on a connected device.
//!
//! The installer is started non-interactively: every answer it would prompt
//! for is passed as an environment variable, and it runs under `sudo -S` on a
//! PTY channel so the sudo prompt shows up in the output stream.
//!
//! ```text
//! chmod +x <script>
//! sudo -S NON_INTERACTIVE=1 EPD_VERSION=.. MANUAL_MODE=.. enable_auth=..
//!         WEBUI_PASSWORD=.. WEBUI_PASSWORD_CONFIRM=..
//!         BLUETOOTH_MAC_ADDRESS=.. GIT_BRANCH=.. bash <script> -online
//! ```
//!
//! The output loop polls the channel every 100 ms and never blocks on a read.
//! Lines become log events, `Step N of M` markers become progress events, and
//! the sudo password is written once, the first time a prompt appears.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use bjorn_core::{Event, LogLevel};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::channel_output::LineSplitter;
use super::remote_session::{
    shell_quote, InstallationState, RemoteSession, SessionError, ShellChannel, POLL_INTERVAL,
    READ_CHUNK,
};

/// Default Bluetooth MAC handed to the installer.
pub const DEFAULT_BLUETOOTH_MAC: &str = "60:57:C8:47:E3:88";

/// Default git branch installed.
pub const DEFAULT_GIT_BRANCH: &str = "main";

const CHMOD_TIMEOUT: Duration = Duration::from_secs(10);

static STEP_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)step\s+(\d+)\s+of\s+(\d+)").expect("valid step marker pattern"));

/// Substrings of a sudo password prompt, lowercase.
const PROMPT_MARKERS: [&[u8]; 2] = [b"[sudo]", b"password for"];

/// Bytes of unsent output kept for prompt detection.
const PROMPT_WINDOW: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("unknown e-paper display {0:?} (expected 1-5 or a driver name)")]
    UnknownEpd(String),
    #[error("unknown install mode {0:?} (expected online, local or debug)")]
    UnknownMode(String),
}

// ── Parameters ────────────────────────────────────────────────────────────────

/// E-paper display driver selected on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpdVariant {
    Epd2in13,
    Epd2in13V2,
    Epd2in13V3,
    #[default]
    Epd2in13V4,
    Epd2in7,
}

impl EpdVariant {
    pub const ALL: [EpdVariant; 5] = [
        Self::Epd2in13,
        Self::Epd2in13V2,
        Self::Epd2in13V3,
        Self::Epd2in13V4,
        Self::Epd2in7,
    ];

    /// Menu number used by the installer (1-5).
    pub fn choice(self) -> u8 {
        match self {
            Self::Epd2in13 => 1,
            Self::Epd2in13V2 => 2,
            Self::Epd2in13V3 => 3,
            Self::Epd2in13V4 => 4,
            Self::Epd2in7 => 5,
        }
    }

    pub fn from_choice(choice: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.choice() == choice)
    }

    /// Driver name as written to the device configuration.
    pub fn driver(self) -> &'static str {
        match self {
            Self::Epd2in13 => "epd2in13",
            Self::Epd2in13V2 => "epd2in13_V2",
            Self::Epd2in13V3 => "epd2in13_V3",
            Self::Epd2in13V4 => "epd2in13_V4",
            Self::Epd2in7 => "epd2in7",
        }
    }
}

impl fmt::Display for EpdVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.driver())
    }
}

/// Accepts a menu number (`"4"`) or a driver name (`"epd2in13_v4"`, any case).
impl FromStr for EpdVariant {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Self::from_choice(n).ok_or_else(|| ParamError::UnknownEpd(s.to_string()));
        }
        Self::ALL
            .into_iter()
            .find(|v| v.driver().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParamError::UnknownEpd(s.to_string()))
    }
}

/// Where the installer takes the Bjorn sources from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    #[default]
    Online,
    Local,
    Debug,
}

impl InstallMode {
    pub fn flag(self) -> &'static str {
        match self {
            Self::Online => "-online",
            Self::Local => "-local",
            Self::Debug => "-debug",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Local => "local",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InstallMode {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('-').to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "local" => Ok(Self::Local),
            "debug" => Ok(Self::Debug),
            _ => Err(ParamError::UnknownMode(s.to_string())),
        }
    }
}

/// Answers handed to the installer.
#[derive(Clone, PartialEq, Eq)]
pub struct InstallParams {
    pub epd: EpdVariant,
    pub manual_mode: bool,
    /// Web UI password; `None` disables web authentication.
    pub webui_password: Option<String>,
    pub bluetooth_mac: String,
    pub install_mode: InstallMode,
    pub git_branch: String,
    /// Reboot the device after a successful installation.
    pub reboot_after: bool,
}

impl Default for InstallParams {
    fn default() -> Self {
        Self {
            epd: EpdVariant::default(),
            manual_mode: true,
            webui_password: None,
            bluetooth_mac: DEFAULT_BLUETOOTH_MAC.to_string(),
            install_mode: InstallMode::default(),
            git_branch: DEFAULT_GIT_BRANCH.to_string(),
            reboot_after: false,
        }
    }
}

impl fmt::Debug for InstallParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallParams")
            .field("epd", &self.epd)
            .field("manual_mode", &self.manual_mode)
            .field("webui_auth", &self.webui_password.is_some())
            .field("bluetooth_mac", &self.bluetooth_mac)
            .field("install_mode", &self.install_mode)
            .field("git_branch", &self.git_branch)
            .field("reboot_after", &self.reboot_after)
            .finish()
    }
}

impl InstallParams {
    /// Environment passed to the installer, in command-line order.
    pub fn environment(&self) -> Vec<(&'static str, String)> {
        let password = self.webui_password.clone().unwrap_or_default();
        vec![
            ("NON_INTERACTIVE", "1".to_string()),
            ("EPD_VERSION", self.epd.driver().to_string()),
            (
                "MANUAL_MODE",
                if self.manual_mode { "True" } else { "False" }.to_string(),
            ),
            (
                "enable_auth",
                if self.webui_password.is_some() { "y" } else { "n" }.to_string(),
            ),
            ("WEBUI_PASSWORD", password.clone()),
            ("WEBUI_PASSWORD_CONFIRM", password),
            ("BLUETOOTH_MAC_ADDRESS", self.bluetooth_mac.clone()),
            ("GIT_BRANCH", self.git_branch.clone()),
        ]
    }
}

/// The privileged, non-interactive installer invocation.  Every value is
/// shell-quoted.
pub fn build_install_command(remote_script: &str, params: &InstallParams) -> String {
    let env: Vec<String> = params
        .environment()
        .into_iter()
        .map(|(key, value)| format!("{key}={}", shell_quote(&value)))
        .collect();
    format!(
        "sudo -S {} bash {} {}",
        env.join(" "),
        shell_quote(remote_script),
        params.install_mode.flag()
    )
}

/// Extracts `(n, total)` from a `Step n of total` marker.
pub fn parse_step_marker(line: &str) -> Option<(u32, u32)> {
    let caps = STEP_MARKER.captures(line)?;
    let current = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse().ok()?;
    Some((current, total))
}

/// Detects the first sudo password prompt in a stream of output chunks.
#[derive(Debug, Default)]
pub struct PromptWatcher {
    unsent: Vec<u8>,
    answered: bool,
}

impl PromptWatcher {
    /// Feeds `chunk`; returns `true` exactly once, when a prompt marker is
    /// first seen.  The buffer is cleared at that point.
    pub fn observe(&mut self, chunk: &[u8]) -> bool {
        if self.answered {
            return false;
        }
        self.unsent.extend(chunk.iter().map(u8::to_ascii_lowercase));
        let found = PROMPT_MARKERS
            .iter()
            .any(|marker| self.unsent.windows(marker.len()).any(|w| w == *marker));
        if found {
            self.answered = true;
            self.unsent.clear();
            return true;
        }
        if self.unsent.len() > PROMPT_WINDOW {
            let excess = self.unsent.len() - PROMPT_WINDOW;
            self.unsent.drain(..excess);
        }
        false
    }

    pub fn answered(&self) -> bool {
        self.answered
    }
}

// ── Installation driver ───────────────────────────────────────────────────────

impl RemoteSession {
    /// Runs the uploaded installer and follows it to completion.
    ///
    /// Returns `Ok(true)` when the installer exits with status 0.  Remote
    /// faults are reported as log events and `Ok(false)`; only
    /// [`SessionError::NotConnected`] and [`SessionError::Busy`] are returned
    /// as errors.  There is no overall timeout.
    pub fn drive_installation(
        &self,
        remote_script: &str,
        params: &InstallParams,
    ) -> Result<bool, SessionError> {
        let _op = self.begin_operation()?;
        self.require_connected()?;
        self.set_installation_state(InstallationState::Running { step: 0, total: 0 });

        let success = match self.run_installer(remote_script, params) {
            Ok(0) => {
                self.log("Installation completed successfully!", LogLevel::Success);
                true
            }
            Ok(code) => {
                self.log(
                    &format!("Installation failed with exit code {code}"),
                    LogLevel::Error,
                );
                false
            }
            Err(e) => {
                self.log(&format!("Error during installation: {e}"), LogLevel::Error);
                false
            }
        };
        self.set_installation_state(InstallationState::Completed { success });

        if success && params.reboot_after {
            self.reboot_unguarded();
        }
        Ok(success)
    }

    fn run_installer(&self, remote_script: &str, params: &InstallParams) -> Result<i32, SessionError> {
        let chmod = format!("chmod +x {}", shell_quote(remote_script));
        let out = self.exec_unguarded(&chmod, None, CHMOD_TIMEOUT)?;
        if !out.success() {
            debug!("chmod exited with {}: {}", out.exit_code, out.stderr.trim());
        }

        self.log(
            &format!(
                "[RUN] Starting installation (branch={}, mode={})",
                params.git_branch, params.install_mode
            ),
            LogLevel::Info,
        );
        let command = build_install_command(remote_script, params);
        let mut channel = self.with_connection(|c| c.open_channel(&command, true))?;
        let result = self.follow_installer(channel.as_mut());
        channel.close();
        result
    }

    fn follow_installer(&self, channel: &mut dyn ShellChannel) -> Result<i32, SessionError> {
        let password = format!("{}\n", self.config().sudo_password());
        let mut buf = [0u8; READ_CHUNK];
        let mut lines = LineSplitter::default();
        let mut prompt = PromptWatcher::default();

        loop {
            let n = channel.read_available(&mut buf)?;
            if n > 0 {
                let chunk = &buf[..n];
                for line in lines.push(chunk) {
                    self.emit_installer_line(&line);
                }
                if prompt.observe(chunk) {
                    channel.send(password.as_bytes())?;
                    self.log("[SUDO] Password sent", LogLevel::Info);
                }
            }

            if let Some(code) = channel.exit_status()? {
                loop {
                    let n = channel.read_available(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    for line in lines.push(&buf[..n]) {
                        self.emit_installer_line(&line);
                    }
                }
                if let Some(rest) = lines.finish() {
                    self.emit_installer_line(&rest);
                }
                return Ok(code);
            }

            if n == 0 {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn emit_installer_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        self.emit(Event::info(line));
        if let Some((current, total)) = parse_step_marker(line) {
            self.set_installation_state(InstallationState::Running {
                step: current,
                total,
            });
            self.emit(Event::Progress {
                current,
                total,
                label: format!("Step {current}/{total}"),
            });
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epd_variant_parses_choice_and_name() {
        assert_eq!("1".parse::<EpdVariant>(), Ok(EpdVariant::Epd2in13));
        assert_eq!("epd2in13_v3".parse::<EpdVariant>(), Ok(EpdVariant::Epd2in13V3));
        assert_eq!("EPD2IN7".parse::<EpdVariant>(), Ok(EpdVariant::Epd2in7));
        assert!("6".parse::<EpdVariant>().is_err());
        assert!("epd9".parse::<EpdVariant>().is_err());
    }

    #[test]
    fn test_default_epd_is_v4() {
        assert_eq!(EpdVariant::default().driver(), "epd2in13_V4");
        assert_eq!(EpdVariant::default().choice(), 4);
    }

    #[test]
    fn test_install_mode_accepts_flag_form() {
        assert_eq!("-local".parse::<InstallMode>(), Ok(InstallMode::Local));
        assert_eq!("Debug".parse::<InstallMode>(), Ok(InstallMode::Debug));
        assert!("offline".parse::<InstallMode>().is_err());
    }

    #[test]
    fn test_default_command_layout() {
        // Arrange
        let params = InstallParams::default();

        // Act
        let cmd = build_install_command("/home/bjorn/install_bjorn.sh", &params);

        // Assert
        let words = shlex::split(&cmd).unwrap();
        assert_eq!(
            words,
            vec![
                "sudo",
                "-S",
                "NON_INTERACTIVE=1",
                "EPD_VERSION=epd2in13_V4",
                "MANUAL_MODE=True",
                "enable_auth=n",
                "WEBUI_PASSWORD=",
                "WEBUI_PASSWORD_CONFIRM=",
                "BLUETOOTH_MAC_ADDRESS=60:57:C8:47:E3:88",
                "GIT_BRANCH=main",
                "bash",
                "/home/bjorn/install_bjorn.sh",
                "-online",
            ]
        );
    }

    #[test]
    fn test_password_with_shell_metacharacters_is_quoted() {
        let params = InstallParams {
            webui_password: Some("p@ss word'; rm -rf /".to_string()),
            manual_mode: false,
            install_mode: InstallMode::Debug,
            ..InstallParams::default()
        };
        let words = shlex::split(&build_install_command("/tmp/i.sh", &params)).unwrap();
        assert!(words.contains(&"enable_auth=y".to_string()));
        assert!(words.contains(&"MANUAL_MODE=False".to_string()));
        assert!(words.contains(&"WEBUI_PASSWORD=p@ss word'; rm -rf /".to_string()));
        assert_eq!(words.last().map(String::as_str), Some("-debug"));
    }

    #[test]
    fn test_step_marker_is_case_insensitive() {
        assert_eq!(parse_step_marker("Step 3 of 8: installing deps"), Some((3, 8)));
        assert_eq!(parse_step_marker("[INFO] STEP 10 OF 12"), Some((10, 12)));
        assert_eq!(parse_step_marker("stepping of"), None);
        assert_eq!(parse_step_marker("Step 99999999999 of 2"), None);
    }

    #[test]
    fn test_prompt_watcher_fires_once() {
        // Arrange
        let mut watcher = PromptWatcher::default();

        // Act
        let first = watcher.observe(b"[sudo] password for bjorn: ");
        let second = watcher.observe(b"[sudo] password for bjorn: ");

        // Assert
        assert!(first);
        assert!(!second);
        assert!(watcher.answered());
    }

    #[test]
    fn test_prompt_marker_split_across_chunks_is_found() {
        let mut watcher = PromptWatcher::default();
        assert!(!watcher.observe(b"Password f"));
        assert!(watcher.observe(b"or bjorn:"));
    }

    #[test]
    fn test_prompt_watcher_ignores_ordinary_output() {
        let mut watcher = PromptWatcher::default();
        for _ in 0..100 {
            assert!(!watcher.observe(b"Step 1 of 8: updating apt sources\n"));
        }
        assert!(!watcher.answered());
    }
}
