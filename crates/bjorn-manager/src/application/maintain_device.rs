//! MaintainDeviceUseCase: service restart, display change, reboot and debug
//! deployment on an installed device.
//!
//! Each operation emits `[SERVICE]`, `[CONFIG]`, `[REBOOT]` or `[DEPLOY]` log
//! events and returns a typed error on failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bjorn_core::LogLevel;
use thiserror::Error;
use tracing::debug;

use super::install_device::EpdVariant;
use super::remote_session::{shell_quote, CommandOutput, RemoteSession, SessionError};

const SERVICE_TIMEOUT: Duration = Duration::from_secs(60);
const CONFIG_TIMEOUT: Duration = Duration::from_secs(15);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(120);
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{action} failed with exit code {code}: {stderr}")]
    CommandFailed {
        action: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("archive not found: {}", .0.display())]
    MissingArchive(PathBuf),
}

fn check(action: &'static str, out: CommandOutput) -> Result<CommandOutput, MaintenanceError> {
    if out.success() {
        Ok(out)
    } else {
        Err(MaintenanceError::CommandFailed {
            action,
            code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

/// Shell script that swaps the extracted archive in place of `<base>/Bjorn`,
/// keeping the previous tree as `Bjorn.bak`.
fn deploy_script(base: &str, owner: &str) -> String {
    let base = shell_quote(base);
    let owner = shell_quote(&format!("{owner}:{owner}"));
    format!(
        r#"#!/bin/bash
set -e
cd {base}
rm -rf Bjorn.tmp Bjorn.new
mkdir -p Bjorn.tmp

if command -v unzip >/dev/null 2>&1; then
    unzip -oq Bjorn.zip -d Bjorn.tmp
else
    python3 -c "import zipfile; zipfile.ZipFile('Bjorn.zip').extractall('Bjorn.tmp')"
fi

FIRST=$(ls Bjorn.tmp | head -n1)
if [ -d "Bjorn.tmp/$FIRST/Bjorn" ]; then
    mv "Bjorn.tmp/$FIRST/Bjorn" Bjorn.new
elif [ -d Bjorn.tmp/Bjorn ]; then
    mv Bjorn.tmp/Bjorn Bjorn.new
else
    mv Bjorn.tmp Bjorn.new
fi

rm -rf Bjorn.bak
if [ -d Bjorn ]; then mv Bjorn Bjorn.bak; fi
mv Bjorn.new Bjorn
rm -rf Bjorn.tmp Bjorn.zip
chown -R {owner} Bjorn || true
chmod -R 755 Bjorn || true
echo "Deploy complete"
"#
    )
}

impl RemoteSession {
    /// `sudo systemctl restart <service>`.
    pub fn restart_service(&self) -> Result<(), MaintenanceError> {
        let _op = self.begin_operation()?;
        self.restart_service_unguarded()
    }

    fn restart_service_unguarded(&self) -> Result<(), MaintenanceError> {
        self.log("[SERVICE] Restarting BJORN service...", LogLevel::Info);
        let command = format!("systemctl restart {}", shell_quote(&self.config().service_name));
        let result = self
            .exec_privileged_unguarded(&command, SERVICE_TIMEOUT)
            .map_err(MaintenanceError::from)
            .and_then(|out| check("service restart", out));
        match result {
            Ok(_) => {
                self.log("[SERVICE] BJORN service restarted", LogLevel::Success);
                Ok(())
            }
            Err(e) => {
                self.log(&format!("[SERVICE] Restart failed: {e}"), LogLevel::Error);
                Err(e)
            }
        }
    }

    /// Points the device configuration at another e-paper driver, clears the
    /// cached JSON configuration and restarts the service.
    pub fn change_epd_type(&self, epd: EpdVariant) -> Result<(), MaintenanceError> {
        let _op = self.begin_operation()?;
        self.log(&format!("[CONFIG] Changing EPD type to {epd}"), LogLevel::Info);

        let bjorn_dir = format!("{}/Bjorn", self.config().remote_base());
        // Driver names are plain identifiers, safe inside the sed expression.
        let command = format!(
            r#"cd {} && sed -i 's/"epd_type": "[^"]*"/"epd_type": "{}"/g' shared.py"#,
            shell_quote(&bjorn_dir),
            epd.driver()
        );
        let edited = self
            .exec_unguarded(&command, None, CONFIG_TIMEOUT)
            .map_err(MaintenanceError::from)
            .and_then(|out| check("EPD change", out));
        if let Err(e) = edited {
            self.log(&format!("[CONFIG] EPD change failed: {e}"), LogLevel::Error);
            return Err(e);
        }

        // The directory is quoted, the glob is not.
        let clear_json = format!("rm -rf {}/*.json", shell_quote(&format!("{bjorn_dir}/config")));
        let clear = format!("sh -c {}", shell_quote(&clear_json));
        match self.exec_privileged_unguarded(&clear, CONFIG_TIMEOUT) {
            Ok(out) if !out.success() => {
                debug!("clearing config exited with {}: {}", out.exit_code, out.stderr.trim())
            }
            Ok(_) => {}
            Err(e) => {
                self.log(&format!("[CONFIG] EPD change failed: {e}"), LogLevel::Error);
                return Err(e.into());
            }
        }
        self.log("[CONFIG] Cleared configuration files", LogLevel::Info);

        self.restart_service_unguarded()
    }

    /// `sudo reboot`.  The connection drops while the command runs, so every
    /// failure is only a warning.
    pub fn reboot(&self) -> Result<(), SessionError> {
        let _op = self.begin_operation()?;
        self.require_connected()?;
        self.reboot_unguarded();
        Ok(())
    }

    pub(crate) fn reboot_unguarded(&self) {
        self.log("[REBOOT] System reboot initiated", LogLevel::Warning);
        if let Err(e) = self.exec_privileged_unguarded("reboot", REBOOT_TIMEOUT) {
            self.log(&format!("Reboot command: {e}"), LogLevel::Warning);
        }
    }

    /// Uploads a debug `Bjorn.zip` and unpacks it over `<remote_dir>/Bjorn`.
    pub fn deploy_archive(&self, archive: &Path) -> Result<(), MaintenanceError> {
        let _op = self.begin_operation()?;
        if !archive.is_file() {
            let e = MaintenanceError::MissingArchive(archive.to_path_buf());
            self.log(&format!("[DEPLOY] Failed: {e}"), LogLevel::Error);
            return Err(e);
        }
        match self.deploy_archive_unguarded(archive) {
            Ok(()) => {
                self.log("[DEPLOY] Bjorn.zip deployed successfully", LogLevel::Success);
                Ok(())
            }
            Err(e) => {
                self.log(&format!("[DEPLOY] Failed: {e}"), LogLevel::Error);
                Err(e)
            }
        }
    }

    fn deploy_archive_unguarded(&self, archive: &Path) -> Result<(), MaintenanceError> {
        let base = self.config().remote_base().to_string();
        let remote_zip = format!("{base}/Bjorn.zip");
        self.upload_unguarded(archive, &remote_zip)?;

        self.log(
            &format!("[RUN] Extracting Bjorn.zip to {base}/Bjorn ..."),
            LogLevel::Info,
        );
        let remote_script = format!("{base}/deploy_tmp.sh");
        let script = deploy_script(&base, &self.config().user);
        self.with_connection(|c| c.write_file(&remote_script, script.as_bytes()))?;

        let quoted = shell_quote(&remote_script);
        let run = self.exec_privileged_unguarded(&format!("bash {quoted}"), DEPLOY_TIMEOUT);
        if let Err(e) = self.exec_unguarded(&format!("rm -f {quoted}"), None, HOUSEKEEPING_TIMEOUT) {
            debug!("removing {remote_script}: {e}");
        }

        let out = check("deploy", run?)?;
        let stdout = out.stdout.trim();
        if !stdout.is_empty() {
            self.log(stdout, LogLevel::Info);
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
