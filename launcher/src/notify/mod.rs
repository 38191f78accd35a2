/// Delivery of domain and advisory events to the remote watcher.
///
/// [`NotifyClient`] holds at most one connection, established lazily on the
/// first send. Every delivery is retried immediately and then every
/// `interval` until it succeeds or `total` has elapsed. Any failure,
/// including a remote `success = false`, drops the connection so the next
/// attempt dials and negotiates afresh.
pub mod error;
pub mod proto;
pub mod transport;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::VmiRef;
use crate::event::DomainEvent;
use crate::paths;

pub use error::NotifyError;
pub use proto::EventSeverity;
use proto::{DomainEventRequest, K8sEvent, K8sEventRequest, ObjectReference, Response};
use transport::{NotifyConnection, UnixNotifyConnection};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const INFO_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyTimeouts {
    /// Pause between delivery attempts.
    pub interval: Duration,
    /// Upper bound for a single request/response exchange.
    pub send: Duration,
    /// Overall budget for one delivery, across all attempts.
    pub total: Duration,
}

impl Default for NotifyTimeouts {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            send: DEFAULT_SEND_TIMEOUT,
            total: DEFAULT_TOTAL_TIMEOUT,
        }
    }
}

/// Sink for the notifications produced by the dispatch loop.
#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn send_domain_event(&self, event: &DomainEvent) -> Result<(), NotifyError>;
    async fn send_k8s_event(
        &self,
        vmi: &VmiRef,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<(), NotifyError>;
}

struct ActiveConnection {
    conn: Box<dyn NotifyConnection>,
    version: u32,
}

enum Outbound {
    Domain(DomainEventRequest),
    K8s(K8sEventRequest),
}

impl Outbound {
    fn kind(&self) -> &'static str {
        match self {
            Outbound::Domain(_) => "domain",
            Outbound::K8s(_) => "k8s",
        }
    }

    async fn send(&self, conn: &mut dyn NotifyConnection) -> Result<Response, NotifyError> {
        match self {
            Outbound::Domain(request) => conn.handle_domain_event(request.clone()).await,
            Outbound::K8s(request) => conn.handle_k8s_event(request.clone()).await,
        }
    }
}

pub struct NotifyClient {
    conn: Mutex<Option<ActiveConnection>>,
    pipe_socket_path: PathBuf,
    legacy_socket_path: PathBuf,
    timeouts: NotifyTimeouts,
}

impl NotifyClient {
    pub fn new(share_dir: &Path) -> Self {
        Self {
            conn: Mutex::new(None),
            pipe_socket_path: paths::pipe_notify_socket(share_dir),
            legacy_socket_path: paths::legacy_notify_socket(share_dir),
            timeouts: NotifyTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: NotifyTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Client for the configured share directory and retry policy.
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.launcher.share_dir).with_timeouts(config.notify.timeouts())
    }

    /// Negotiated protocol version of the live connection, if any.
    pub async fn negotiated_version(&self) -> Option<u32> {
        self.conn.lock().await.as_ref().map(|active| active.version)
    }

    /// Drops the live connection, if any.
    pub async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            debug!("closed domain notify connection");
        }
    }

    /// The legacy socket wins when present: it only exists when the watcher
    /// still shares a host path with the launcher.
    fn detect_socket_path(&self) -> &Path {
        if self.legacy_socket_path.exists() {
            &self.legacy_socket_path
        } else {
            &self.pipe_socket_path
        }
    }

    async fn connect(&self) -> Result<ActiveConnection, NotifyError> {
        let socket_path = self.detect_socket_path();

        let mut conn = UnixNotifyConnection::dial(socket_path, DIAL_TIMEOUT)
            .await
            .inspect_err(|e| {
                info!(socket = %socket_path.display(), error = %e, "failed to dial notify socket");
            })?;

        let version = negotiate_version(&mut conn)
            .await
            .inspect_err(|e| info!(error = %e, "failed to negotiate notify version"))?;

        info!(
            socket = %socket_path.display(),
            version,
            "Successfully connected to domain notify socket"
        );
        Ok(ActiveConnection {
            conn: Box::new(conn),
            version,
        })
    }

    /// One delivery attempt. The connection is put back only on success.
    async fn attempt(&self, outbound: &Outbound) -> Result<(), NotifyError> {
        let mut slot = self.conn.lock().await;

        let mut active = match slot.take() {
            Some(active) => active,
            None => self
                .connect()
                .await
                .inspect_err(|e| error!(error = %e, "Failed to connect to notify server"))?,
        };

        let kind = outbound.kind();
        match tokio::time::timeout(self.timeouts.send, outbound.send(active.conn.as_mut())).await
        {
            Ok(Ok(response)) if response.success => {
                *slot = Some(active);
                Ok(())
            }
            Ok(Ok(response)) => {
                warn!(kind, message = %response.message, "notify server rejected event, closing connection");
                Err(NotifyError::Rejected {
                    kind,
                    message: response.message,
                })
            }
            Ok(Err(e)) => {
                error!(kind, error = %e, "Failed to send notify event, closing connection");
                Err(e)
            }
            Err(_) => {
                error!(kind, "notify event timed out, closing connection");
                Err(NotifyError::Timeout(self.timeouts.send))
            }
        }
    }

    async fn deliver(&self, outbound: Outbound) -> Result<(), NotifyError> {
        let deadline = Instant::now() + self.timeouts.total;
        loop {
            let err = match self.attempt(&outbound).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if Instant::now() + self.timeouts.interval >= deadline {
                info!(kind = outbound.kind(), error = %err, "Failed to send notify event");
                return Err(err);
            }
            tokio::time::sleep(self.timeouts.interval).await;
        }
    }
}

#[async_trait]
impl EventNotifier for NotifyClient {
    async fn send_domain_event(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        let (domain_json, status_json) = match event {
            DomainEvent::Added(domain) | DomainEvent::Modified(domain) => {
                (serde_json::to_string(domain)?, String::new())
            }
            DomainEvent::Error(status) => (String::new(), serde_json::to_string(status)?),
        };
        self.deliver(Outbound::Domain(DomainEventRequest {
            domain_json,
            status_json,
            event_type: event.event_type().to_string(),
        }))
        .await
    }

    async fn send_k8s_event(
        &self,
        vmi: &VmiRef,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<(), NotifyError> {
        let event = K8sEvent {
            involved_object: ObjectReference::for_vmi(vmi),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        };
        self.deliver(Outbound::K8s(K8sEventRequest {
            event_json: serde_json::to_string(&event)?,
        }))
        .await
    }
}

/// Asks the server for its supported versions and picks the one to speak.
pub async fn negotiate_version(conn: &mut dyn NotifyConnection) -> Result<u32, NotifyError> {
    let info = tokio::time::timeout(INFO_TIMEOUT, conn.info())
        .await
        .map_err(|_| NotifyError::Info(Box::new(NotifyError::Timeout(INFO_TIMEOUT))))?
        .map_err(|e| NotifyError::Info(Box::new(e)))?;

    let version =
        highest_compatible_version(&info.supported_notify_versions, proto::SUPPORTED_VERSIONS)?;

    // Newer versions are never assumed to be wire compatible.
    match version {
        1 => Ok(version),
        other => Err(NotifyError::VersionNotImplemented(other)),
    }
}

pub fn highest_compatible_version(server: &[u32], client: &[u32]) -> Result<u32, NotifyError> {
    server
        .iter()
        .filter(|v| client.contains(v))
        .max()
        .copied()
        .ok_or_else(|| NotifyError::NoCompatibleVersion {
            server: server.to_vec(),
            client: client.to_vec(),
        })
}
