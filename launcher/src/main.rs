use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use virt_launcher::event::LauncherEvent;
use virt_launcher::notify::NotifyClient;
use virt_launcher::supervisor::Supervisors;
use virt_launcher::{config, paths, vmm_monitor};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path();
    let config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "Config error, using defaults");
        config::Config::default()
    });
    let hypervisor = config.launcher.hypervisor;

    // ── Supervised daemons ────────────────────────────────────────────────────
    let supervisors = match Supervisors::start(&config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to start hypervisor daemons");
            std::process::exit(1);
        }
    };

    // ── Notify client ─────────────────────────────────────────────────────────
    // Connects lazily on the first event; closed on shutdown.
    let notify_client = Arc::new(NotifyClient::from_config(&config));

    let (event_tx, mut event_rx) = mpsc::channel::<LauncherEvent>(32);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(vmm_monitor::run(
        hypervisor.vmm_process_prefixes(),
        event_tx.clone(),
    ));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(LauncherEvent::Shutdown).await;
            }
        });
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hypervisor = %hypervisor,
        domain = %config.domain_name(),
        uri = %hypervisor.connection_uri(),
        socket = %hypervisor.libvirt_socket_path(),
        share_dir = %config.launcher.share_dir.display(),
        notify_total_timeout_ms = config.notify.total_timeout_ms,
        "virt-launcher started"
    );

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            LauncherEvent::VmmStarted { pid, name } => {
                info!(pid, name = %name, runtime_dir = %paths::runtime_dir(hypervisor.vmm()).display(), "Domain is running");
            }
            LauncherEvent::VmmExited { pid } => {
                info!(pid, "Domain process is gone");
            }
            LauncherEvent::Shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    notify_client.close().await;
    supervisors.stop().await;
}
