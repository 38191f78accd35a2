use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::info;

use crate::event::LauncherEvent;

const POLL_INTERVAL_SECS: u64 = 2;

/// Polls the OS process list every [`POLL_INTERVAL_SECS`] seconds and emits
/// [`LauncherEvent::VmmStarted`] / [`LauncherEvent::VmmExited`] events
/// whenever a VMM process matching `prefixes` appears or disappears.
///
/// Only one VMM is tracked at a time; the pod runs a single domain.
pub async fn run(prefixes: &'static [&'static str], tx: mpsc::Sender<LauncherEvent>) {
    let mut sys = System::new();
    let mut active_pid: Option<u32> = None;
    let mut ticker = interval(Duration::from_secs(POLL_INTERVAL_SECS));

    loop {
        ticker.tick().await;

        sys.refresh_processes(ProcessesToUpdate::All, true);

        let found = sys.processes().iter().find_map(|(pid, process)| {
            let name = process.name().to_string_lossy();
            matches_vmm(&name, prefixes).then(|| (pid.as_u32(), name.into_owned()))
        });

        let event = match (active_pid, found) {
            (None, Some((pid, name))) => {
                info!(pid, name = %name, "VMM process started");
                active_pid = Some(pid);
                LauncherEvent::VmmStarted { pid, name }
            }
            (Some(pid), None) => {
                info!(pid, "VMM process exited");
                active_pid = None;
                LauncherEvent::VmmExited { pid }
            }
            _ => continue,
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

/// True if the process `name` belongs to one of the VMM binaries.
pub fn matches_vmm(name: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| name.starts_with(prefix))
}
