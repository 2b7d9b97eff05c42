//! Bjorn Manager command-line entry point.
//!
//! ```text
//! main()
//!  └─ load AppConfig (--config or the platform config dir)
//!  └─ printer task        -- renders Events as text or JSON lines
//!  └─ subcommand
//!       ├─ discover        DiscoveryEngine until Ctrl+C
//!       ├─ install         upload assets, drive the installer
//!       ├─ logs            follow the device service journal until Ctrl+C
//!       └─ service         restart | epd | reboot | deploy
//! ```
//!
//! SSH work is blocking and runs on Tokio's blocking pool.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bjorn_core::{DeviceRegistry, Event, EventSink, LogLevel};
use bjorn_manager::application::discover_devices::DiscoveryEngine;
use bjorn_manager::application::install_device::{
    EpdVariant, InstallMode, InstallParams, DEFAULT_BLUETOOTH_MAC, DEFAULT_GIT_BRANCH,
};
use bjorn_manager::application::remote_session::{RemoteSession, SessionConfig};
use bjorn_manager::infrastructure::network::system_ports;
use bjorn_manager::infrastructure::ssh::Libssh2Connector;
use bjorn_manager::infrastructure::storage::aliases::FileAliasStore;
use bjorn_manager::infrastructure::storage::config::{self, AppConfig};

/// How long the printer may keep draining after the work is done.
const PRINTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Finds Bjorn devices on the local network and installs or maintains them
/// over SSH.
#[derive(Debug, Parser)]
#[command(name = "bjorn-manager", about, version)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, env = "BJORN_MANAGER_CONFIG")]
    config: Option<PathBuf>,

    /// Print events as JSON lines instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch the network for Bjorn devices until Ctrl+C.
    Discover {
        /// Report every SSH host, not only `bjorn`-named ones.
        #[arg(long)]
        all_hosts: bool,
    },
    /// Upload the installer and run it on a device.
    Install(InstallArgs),
    /// Follow the device service journal until Ctrl+C.
    Logs {
        #[command(flatten)]
        ssh: SshArgs,
    },
    /// Maintenance actions on an installed device.
    Service {
        #[command(flatten)]
        ssh: SshArgs,

        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Debug, Subcommand)]
enum ServiceAction {
    /// Restart the Bjorn service.
    Restart,
    /// Switch the e-paper driver and restart the service.
    Epd {
        /// Menu number (1-5) or driver name, e.g. `epd2in13_V4`.
        variant: EpdVariant,
    },
    /// Reboot the device.
    Reboot,
    /// Upload and unpack a `Bjorn.zip` debug archive.
    Deploy {
        archive: PathBuf,
    },
}

/// Connection options shared by every SSH subcommand.
#[derive(Debug, clap::Args)]
struct SshArgs {
    /// Device hostname or IP address.
    host: String,

    /// Login user (default from config, normally `bjorn`).
    #[arg(long)]
    user: Option<String>,

    /// SSH port (default from config).
    #[arg(long)]
    port: Option<u16>,

    /// Private key to try before the password.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Login password, used when key authentication fails.
    #[arg(long, env = "BJORN_SSH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Password for `sudo`; defaults to the login password.
    #[arg(long, env = "BJORN_SUDO_PASSWORD", hide_env_values = true)]
    sudo_password: Option<String>,
}

impl SshArgs {
    /// Overlays the command-line options on the `[ssh]` config section.
    fn into_session_config(self, app: &AppConfig) -> SessionConfig {
        let mut cfg = app.ssh.session_config(&self.host);
        if let Some(user) = self.user {
            cfg.user = user;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if self.key.is_some() {
            cfg.key_path = self.key;
        }
        cfg.password = self.password;
        cfg.sudo_password = self.sudo_password;
        cfg
    }
}

#[derive(Debug, clap::Args)]
struct InstallArgs {
    #[command(flatten)]
    ssh: SshArgs,

    /// Local directory holding `install_bjorn.sh` and its `lib/` fragments.
    #[arg(long)]
    assets: PathBuf,

    /// E-paper variant: menu number (1-5) or driver name.
    #[arg(long, default_value_t = EpdVariant::default())]
    epd: EpdVariant,

    /// Where the installer takes the sources from: online, local or debug.
    #[arg(long, default_value_t = InstallMode::default())]
    mode: InstallMode,

    #[arg(long, default_value = DEFAULT_GIT_BRANCH)]
    branch: String,

    /// Bluetooth MAC address used for the PAN link.
    #[arg(long, default_value = DEFAULT_BLUETOOTH_MAC)]
    bt_mac: String,

    /// Enables web UI authentication with this password.
    #[arg(long, env = "BJORN_WEBUI_PASSWORD", hide_env_values = true)]
    webui_password: Option<String>,

    /// Start Bjorn in automatic mode instead of manual mode.
    #[arg(long)]
    auto_mode: bool,

    /// Reboot the device after a successful installation.
    #[arg(long)]
    reboot_after: bool,
}

impl InstallArgs {
    fn params(&self) -> InstallParams {
        InstallParams {
            epd: self.epd,
            manual_mode: !self.auto_mode,
            webui_password: self.webui_password.clone(),
            bluetooth_mac: self.bt_mac.clone(),
            install_mode: self.mode,
            git_branch: self.branch.clone(),
            reboot_after: self.reboot_after,
        }
    }
}

// ── Event rendering ───────────────────────────────────────────────────────────

/// Formats one event for the terminal, or `None` when it is filtered out.
fn render(event: &Event, json: bool, show_device_gone: bool) -> Option<String> {
    if matches!(event, Event::DeviceGone { .. }) && !show_device_gone {
        return None;
    }
    if json {
        return serde_json::to_string(event).ok();
    }
    let line = match event {
        Event::Log { message, level } => {
            let tag = match level {
                LogLevel::Info => "info",
                LogLevel::Warning => "warn",
                LogLevel::Error => "error",
                LogLevel::Success => "ok",
            };
            format!("{tag:>5}  {message}")
        }
        Event::Progress {
            current,
            total,
            label,
        } => format!("[{current}/{total}] {label}"),
        Event::DeviceFound {
            alias,
            address,
            webapp_reachable,
        } => format!(
            "found  {alias} at {address} (web UI {})",
            if *webapp_reachable { "up" } else { "down" }
        ),
        Event::DeviceGone { address } => format!(" gone  {address}"),
        Event::WebappStatus { address, reachable } => format!(
            "  web  {address} {}",
            if *reachable { "up" } else { "down" }
        ),
    };
    Some(line)
}

fn spawn_printer(
    mut rx: mpsc::UnboundedReceiver<Event>,
    json: bool,
    show_device_gone: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = render(&event, json, show_device_gone) {
                println!("{line}");
            }
        }
    })
}

/// Clears `flag` on the first Ctrl+C.
fn spawn_ctrl_c(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                flag.store(false, Ordering::SeqCst);
            }
            Err(e) => error!("failed to listen for Ctrl+C: {e}"),
        }
    });
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn run_discover(app: &AppConfig, all_hosts: bool, sink: Arc<dyn EventSink>) -> anyhow::Result<()> {
    let mut engine_config = app
        .discovery
        .to_engine_config()
        .context("invalid [discovery] settings")?;
    if all_hosts {
        engine_config.strict_mode = false;
    }

    let registry = if app.manager.persist_aliases {
        let store = FileAliasStore::in_config_dir().context("locating alias store")?;
        info!("persisting aliases to {}", store.path().display());
        DeviceRegistry::with_store(Box::new(store))
    } else {
        DeviceRegistry::new()
    };

    let engine = Arc::new(DiscoveryEngine::with_registry(
        engine_config,
        system_ports(),
        sink,
        registry,
    ));
    if !engine.start() {
        anyhow::bail!("discovery engine is already running");
    }

    let running = Arc::new(AtomicBool::new(true));
    spawn_ctrl_c(Arc::clone(&running));
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    tokio::task::spawn_blocking(move || engine.stop())
        .await
        .context("discovery shutdown panicked")?;
    Ok(())
}

/// Connects, runs `work` on the blocking pool, then closes the session.
async fn with_session<F>(cfg: SessionConfig, sink: Arc<dyn EventSink>, work: F) -> anyhow::Result<()>
where
    F: FnOnce(&RemoteSession) -> anyhow::Result<()> + Send + 'static,
{
    let host = cfg.target().to_string();
    tokio::task::spawn_blocking(move || {
        let session = RemoteSession::new(cfg, Arc::new(Libssh2Connector::new()), sink);
        if !session.connect() {
            anyhow::bail!("could not connect to {host}");
        }
        let result = work(&session);
        session.close();
        result
    })
    .await
    .context("SSH worker panicked")?
}

async fn run_install(app: &AppConfig, args: InstallArgs, sink: Arc<dyn EventSink>) -> anyhow::Result<()> {
    let params = args.params();
    let assets = args.assets;
    info!("installing with {params:?}");
    let cfg = args.ssh.into_session_config(app);
    with_session(cfg, sink, move |session| {
        let script = session
            .upload_install_assets(&assets)
            .context("uploading install scripts")?;
        if session.drive_installation(&script, &params)? {
            Ok(())
        } else {
            anyhow::bail!("installation failed")
        }
    })
    .await
}

async fn run_logs(app: &AppConfig, ssh: SshArgs, sink: Arc<dyn EventSink>) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    spawn_ctrl_c(Arc::clone(&running));

    // `stream_logs` stops when its flag is set, so it gets the inverse.
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_watch = Arc::clone(&cancel);
    tokio::spawn(async move {
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        cancel_watch.store(true, Ordering::SeqCst);
    });

    let cfg = ssh.into_session_config(app);
    with_session(cfg, sink, move |session| {
        session.stream_logs(&cancel)?;
        Ok(())
    })
    .await
}

async fn run_service(
    app: &AppConfig,
    ssh: SshArgs,
    action: ServiceAction,
    sink: Arc<dyn EventSink>,
) -> anyhow::Result<()> {
    let cfg = ssh.into_session_config(app);
    with_session(cfg, sink, move |session| {
        match action {
            ServiceAction::Restart => session.restart_service()?,
            ServiceAction::Epd { variant } => session.change_epd_type(variant)?,
            ServiceAction::Reboot => session.reboot()?,
            ServiceAction::Deploy { archive } => session.deploy_archive(&archive)?,
        }
        Ok(())
    })
    .await
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let app = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
    .context("loading configuration")?;

    // `RUST_LOG` wins over the configured level.  Logs go to stderr so
    // `--json` output stays machine-readable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&app.manager.log_level)),
        )
        .init();

    info!("Bjorn Manager {} starting", env!("CARGO_PKG_VERSION"));

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let printer = spawn_printer(rx, cli.json, app.manager.show_device_gone);
    let sink: Arc<dyn EventSink> = Arc::new(tx);

    let result = match cli.command {
        Command::Discover { all_hosts } => run_discover(&app, all_hosts, sink).await,
        Command::Install(args) => run_install(&app, args, sink).await,
        Command::Logs { ssh } => run_logs(&app, ssh, sink).await,
        Command::Service { ssh, action } => run_service(&app, ssh, action, sink).await,
    };

    // Background threads that outlived a bounded join may still hold a
    // sender, so the printer only gets a short grace period.
    if tokio::time::timeout(PRINTER_DRAIN_TIMEOUT, printer).await.is_err() {
        warn!("event printer did not drain in time");
    }

    result
}

// ── Tests ─────────────────────────────────────────────────────────────────────
