use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{VmiRef, DEFAULT_NAMESPACE};
use crate::hypervisor::HypervisorKind;
use crate::notify::NotifyTimeouts;

pub const DEFAULT_SHARE_DIR: &str = "/var/run/kubevirt";
pub const DEFAULT_NOTIFY_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_NOTIFY_SEND_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_NOTIFY_TOTAL_TIMEOUT_MS: u64 = 20_000;
/// Lower bound for the retry interval, so a bad config cannot spin the client.
pub const MIN_NOTIFY_INTERVAL_MS: u64 = 10;
pub const DEFAULT_RESTART_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_LOG_FILE_POLL_MS: u64 = 1_000;
pub const DEFAULT_MAX_LINE_BYTES: usize = 512 * 1024;

/// Root configuration structure. Deserialized from the launcher TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default = "default_vmi")]
    pub vmi: VmiRef,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            launcher: LauncherConfig::default(),
            vmi: default_vmi(),
            notify: NotifyConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Composite hypervisor name of the domain this launcher runs.
    pub fn domain_name(&self) -> String {
        self.vmi.domain_name()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    /// Directory holding the notify sockets shared with the watcher.
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,
    #[serde(default)]
    pub hypervisor: HypervisorKind,
    /// Use the private non-root libvirt layout.
    #[serde(default)]
    pub non_root: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            share_dir: default_share_dir(),
            hypervisor: HypervisorKind::default(),
            non_root: false,
        }
    }
}

/// Delivery timeouts for the notify client, in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_notify_send_timeout")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_notify_total_timeout")]
    pub total_timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_NOTIFY_INTERVAL_MS,
            send_timeout_ms: DEFAULT_NOTIFY_SEND_TIMEOUT_MS,
            total_timeout_ms: DEFAULT_NOTIFY_TOTAL_TIMEOUT_MS,
        }
    }
}

impl NotifyConfig {
    /// Returns the effective timeouts. The interval is clamped to at least
    /// [`MIN_NOTIFY_INTERVAL_MS`].
    pub fn timeouts(&self) -> NotifyTimeouts {
        NotifyTimeouts {
            interval: Duration::from_millis(self.interval_ms.max(MIN_NOTIFY_INTERVAL_MS)),
            send: Duration::from_millis(self.send_timeout_ms),
            total: Duration::from_millis(self.total_timeout_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Pause before respawning an exited daemon.
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_ms: u64,
    /// How often to check for the guest log file before it exists.
    #[serde(default = "default_log_file_poll")]
    pub log_file_poll_ms: u64,
    /// Daemon output lines longer than this are dropped.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_backoff_ms: DEFAULT_RESTART_BACKOFF_MS,
            log_file_poll_ms: DEFAULT_LOG_FILE_POLL_MS,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn log_file_poll(&self) -> Duration {
        Duration::from_millis(self.log_file_poll_ms)
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_vmi() -> VmiRef {
    VmiRef {
        namespace: DEFAULT_NAMESPACE.to_string(),
        ..VmiRef::default()
    }
}

fn default_share_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SHARE_DIR)
}

fn default_notify_interval() -> u64 {
    DEFAULT_NOTIFY_INTERVAL_MS
}

fn default_notify_send_timeout() -> u64 {
    DEFAULT_NOTIFY_SEND_TIMEOUT_MS
}

fn default_notify_total_timeout() -> u64 {
    DEFAULT_NOTIFY_TOTAL_TIMEOUT_MS
}

fn default_restart_backoff() -> u64 {
    DEFAULT_RESTART_BACKOFF_MS
}

fn default_log_file_poll() -> u64 {
    DEFAULT_LOG_FILE_POLL_MS
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}
