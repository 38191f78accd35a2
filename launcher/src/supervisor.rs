/// Restart-on-exit supervision of the launcher's long-lived subordinates.
///
/// [`Supervisors`] owns three tasks:
///   - the hypervisor daemon (`virtqemud` / `virtchd`)
///   - the `virtlogd` log sidecar
///   - the guest console log follower
///
/// All of them share one stop signal. A daemon that exits is respawned after
/// a fixed backoff; only the very first spawn is allowed to fail the caller.
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{error, info, warn};

use crate::config::{Config, SupervisorConfig};
use crate::hypervisor::HypervisorKind;
use crate::log_sink::{self, LogSink};
use crate::paths;
use crate::tail::LogFollower;

/// What to run and how to restart it.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub restart_backoff: Duration,
    /// Output lines longer than this are dropped.
    pub max_line_bytes: usize,
}

impl DaemonSpec {
    /// `<daemon> -f <daemon config>`.
    pub fn hypervisor_daemon(
        kind: HypervisorKind,
        non_root: bool,
        supervisor: &SupervisorConfig,
    ) -> Self {
        let daemon = kind.daemon_name();
        let config = paths::daemon_config_path(daemon, non_root);
        Self {
            name: daemon.to_string(),
            program: daemon.to_string(),
            args: vec!["-f".to_string(), config.to_string_lossy().into_owned()],
            restart_backoff: supervisor.restart_backoff(),
            max_line_bytes: supervisor.max_line_bytes,
        }
    }

    /// `virtlogd -f /etc/libvirt/virtlogd.conf`.
    pub fn log_sidecar(supervisor: &SupervisorConfig) -> Self {
        Self {
            name: "virtlogd".to_string(),
            program: "virtlogd".to_string(),
            args: vec![
                "-f".to_string(),
                paths::virtlogd_config_path().to_string_lossy().into_owned(),
            ],
            restart_backoff: supervisor.restart_backoff(),
            max_line_bytes: supervisor.max_line_bytes,
        }
    }

    fn spawn(&self) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.name))
    }
}

/// A running supervision loop.
pub struct DaemonSupervisor {
    handle: JoinHandle<()>,
    restarts: Arc<AtomicU32>,
}

impl DaemonSupervisor {
    /// Spawns the daemon and starts supervising it. Fails only if the first
    /// spawn fails.
    pub fn start(spec: DaemonSpec, sink: LogSink, stop: watch::Receiver<bool>) -> Result<Self> {
        let child = spec.spawn()?;
        info!(daemon = %spec.name, pid = child.id(), "Started daemon");

        let restarts = Arc::new(AtomicU32::new(0));
        let handle = tokio::spawn(supervise(spec, sink, child, Arc::clone(&restarts), stop));
        Ok(Self { handle, restarts })
    }

    /// Number of respawns so far.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Waits for the loop to end after the stop signal.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn supervise(
    spec: DaemonSpec,
    sink: LogSink,
    mut child: Child,
    restarts: Arc<AtomicU32>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        forward_output(&mut child, &spec, &sink);

        tokio::select! {
            _ = stop_requested(&mut stop) => {
                info!(daemon = %spec.name, "Stopping daemon");
                if let Err(e) = child.kill().await {
                    warn!(daemon = %spec.name, error = %e, "Failed to kill daemon");
                }
                return;
            }
            status = child.wait() => match status {
                Ok(status) => warn!(daemon = %spec.name, %status, "Daemon exited, restarting"),
                Err(e) => warn!(daemon = %spec.name, error = %e, "Failed to wait for daemon, restarting"),
            },
        }

        // Respawn failures are retried after the same backoff.
        loop {
            tokio::select! {
                _ = tokio::time::sleep(spec.restart_backoff) => {}
                _ = stop_requested(&mut stop) => return,
            }
            match spec.spawn() {
                Ok(new_child) => {
                    info!(daemon = %spec.name, pid = new_child.id(), "Restarted daemon");
                    restarts.fetch_add(1, Ordering::SeqCst);
                    child = new_child;
                    break;
                }
                Err(e) => error!(daemon = %spec.name, error = %format!("{e:#}"), "Failed to restart daemon"),
            }
        }
    }
}

/// Resolves once stop is signalled or the sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

fn forward_output(child: &mut Child, spec: &DaemonSpec, sink: &LogSink) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, spec.name.clone(), spec.max_line_bytes, Arc::clone(sink)));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, spec.name.clone(), spec.max_line_bytes, Arc::clone(sink)));
    }
}

/// Splits daemon output on `\n` and forwards each line. Bytes that are not
/// UTF-8 are replaced rather than ending the stream.
async fn forward_lines<R>(reader: R, daemon: String, max_line_bytes: usize, sink: LogSink)
where
    R: AsyncRead + Unpin,
{
    let codec =
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_line_bytes);
    let mut lines = FramedRead::new(reader, codec);
    while let Some(line) = lines.next().await {
        match line {
            Ok(bytes) => {
                let line = String::from_utf8_lossy(&bytes);
                sink(line.strip_suffix('\r').unwrap_or(&*line));
            }
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                warn!(daemon = %daemon, max_line_bytes, "Dropping overlong daemon output line");
            }
            Err(AnyDelimiterCodecError::Io(e)) => {
                warn!(daemon = %daemon, error = %e, "Failed to read daemon output");
                break;
            }
        }
    }
}

/// The launcher's full set of supervised subordinates.
pub struct Supervisors {
    /// Setting this to `true` signals every loop to stop.
    stop_tx: watch::Sender<bool>,
    daemons: Vec<DaemonSupervisor>,
    follower: JoinHandle<()>,
}

impl Supervisors {
    /// Starts the hypervisor daemon, the log sidecar and the guest log
    /// follower. Fails if either daemon cannot be spawned.
    pub fn start(config: &Config) -> Result<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let launcher = &config.launcher;
        let supervisor = &config.supervisor;

        let hypervisor = DaemonSupervisor::start(
            DaemonSpec::hypervisor_daemon(launcher.hypervisor, launcher.non_root, supervisor),
            Arc::new(log_sink::libvirt_line),
            stop_rx.clone(),
        )?;
        let sidecar = DaemonSupervisor::start(
            DaemonSpec::log_sidecar(supervisor),
            Arc::new(log_sink::virtlogd_line),
            stop_rx.clone(),
        )?;

        let follower = LogFollower {
            path: paths::domain_log_path(
                launcher.hypervisor.vmm(),
                &config.domain_name(),
                launcher.non_root,
            ),
            poll: supervisor.log_file_poll(),
            max_line_bytes: supervisor.max_line_bytes,
            sink: Arc::new(log_sink::guest_console_line),
        };
        let follower = tokio::spawn(follower.run(stop_rx));

        Ok(Self {
            stop_tx,
            daemons: vec![hypervisor, sidecar],
            follower,
        })
    }

    /// Signals all loops to stop and waits for them to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for daemon in self.daemons {
            daemon.join().await;
        }
        let _ = self.follower.await;
    }
}
