/// Canonical filesystem locations used by the launcher.
///
/// Root launchers use the stock libvirt layout under /etc and /var/log;
/// non-root launchers keep everything under the private runtime directory:
///   - /var/run/kubevirt-private/libvirt/<daemon>.conf
///   - /var/run/kubevirt-private/libvirt/<vmm>/log/<domain>.log
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "VIRT_LAUNCHER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "/etc/virt-launcher/launcher.toml";

pub const LEGACY_NOTIFY_SOCKET_NAME: &str = "domain-notify.sock";
pub const PIPE_NOTIFY_SOCKET_NAME: &str = "domain-notify-pipe.sock";

const LIBVIRT_CONFIG_DIR: &str = "/etc/libvirt";
const NON_ROOT_LIBVIRT_DIR: &str = "/var/run/kubevirt-private/libvirt";
const LIBVIRT_RUNTIME_DIR: &str = "/run/libvirt";
const LOG_DIR: &str = "/var/log";

/// Returns the launcher config file: `$VIRT_LAUNCHER_CONFIG` when set and
/// non-empty, /etc/virt-launcher/launcher.toml otherwise.
pub fn config_file_path() -> PathBuf {
    config_file_path_from(std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
}

fn config_file_path_from(env_value: Option<PathBuf>) -> PathBuf {
    env_value
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Notify socket shared with older watchers through a host path.
pub fn legacy_notify_socket(share_dir: &Path) -> PathBuf {
    share_dir.join(LEGACY_NOTIFY_SOCKET_NAME)
}

/// Notify socket proxied into the launcher's share directory.
pub fn pipe_notify_socket(share_dir: &Path) -> PathBuf {
    share_dir.join(PIPE_NOTIFY_SOCKET_NAME)
}

/// Config file passed to a libvirt daemon with `-f`.
pub fn daemon_config_path(daemon: &str, non_root: bool) -> PathBuf {
    let dir = if non_root {
        NON_ROOT_LIBVIRT_DIR
    } else {
        LIBVIRT_CONFIG_DIR
    };
    Path::new(dir).join(format!("{daemon}.conf"))
}

/// The virtlogd config is always the stock one.
pub fn virtlogd_config_path() -> PathBuf {
    Path::new(LIBVIRT_CONFIG_DIR).join("virtlogd.conf")
}

/// Runtime directory of the hypervisor driver, e.g. /run/libvirt/qemu.
pub fn runtime_dir(vmm: &str) -> PathBuf {
    Path::new(LIBVIRT_RUNTIME_DIR).join(vmm)
}

/// Guest console log written by virtlogd for `domain`.
pub fn domain_log_path(vmm: &str, domain: &str, non_root: bool) -> PathBuf {
    let dir = if non_root {
        Path::new(NON_ROOT_LIBVIRT_DIR).join(vmm).join("log")
    } else {
        Path::new(LOG_DIR).join(vmm)
    };
    dir.join(format!("{domain}.log"))
}
