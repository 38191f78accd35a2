/// Framed Unix-socket transport for the notify protocol.
///
/// Each request and reply is one length-delimited frame holding a JSON
/// envelope ([`Request`] / [`Reply`]). The client side is
/// [`UnixNotifyConnection`]; the watcher side runs [`serve`].
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::error::NotifyError;
use super::proto::{
    DomainEventRequest, InfoResponse, K8sEventRequest, Reply, Request, Response,
};

/// Client half of a notify connection.
#[async_trait]
pub trait NotifyConnection: Send {
    async fn info(&mut self) -> Result<InfoResponse, NotifyError>;
    async fn handle_domain_event(
        &mut self,
        request: DomainEventRequest,
    ) -> Result<Response, NotifyError>;
    async fn handle_k8s_event(&mut self, request: K8sEventRequest)
        -> Result<Response, NotifyError>;
}

pub struct UnixNotifyConnection {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl UnixNotifyConnection {
    pub async fn dial(path: &Path, timeout: Duration) -> Result<Self, NotifyError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| NotifyError::DialTimeout {
                path: path.to_path_buf(),
            })?
            .map_err(|source| NotifyError::Dial {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        })
    }

    async fn call(&mut self, request: &Request) -> Result<Reply, NotifyError> {
        let body = serde_json::to_vec(request)?;
        self.framed.send(Bytes::from(body)).await?;
        let frame = self
            .framed
            .next()
            .await
            .ok_or(NotifyError::ConnectionClosed)??;
        Ok(serde_json::from_slice(&frame)?)
    }

    async fn call_for_response(
        &mut self,
        request: &Request,
        name: &'static str,
    ) -> Result<Response, NotifyError> {
        match self.call(request).await? {
            Reply::Response(response) => Ok(response),
            Reply::Info(_) => Err(NotifyError::UnexpectedReply(name)),
        }
    }
}

#[async_trait]
impl NotifyConnection for UnixNotifyConnection {
    async fn info(&mut self) -> Result<InfoResponse, NotifyError> {
        match self.call(&Request::Info).await? {
            Reply::Info(info) => Ok(info),
            Reply::Response(_) => Err(NotifyError::UnexpectedReply("Info")),
        }
    }

    async fn handle_domain_event(
        &mut self,
        request: DomainEventRequest,
    ) -> Result<Response, NotifyError> {
        self.call_for_response(&Request::HandleDomainEvent(request), "HandleDomainEvent")
            .await
    }

    async fn handle_k8s_event(
        &mut self,
        request: K8sEventRequest,
    ) -> Result<Response, NotifyError> {
        self.call_for_response(&Request::HandleK8sEvent(request), "HandleK8sEvent")
            .await
    }
}

/// Watcher-side handler for incoming notifications.
#[async_trait]
pub trait NotifyHandler: Send + Sync + 'static {
    fn supported_versions(&self) -> Vec<u32>;
    async fn handle_domain_event(&self, request: DomainEventRequest) -> Response;
    async fn handle_k8s_event(&self, request: K8sEventRequest) -> Response;
}

/// Binds `path`, replacing a stale socket file left by a previous watcher.
pub fn bind(path: &Path) -> Result<UnixListener, NotifyError> {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    Ok(UnixListener::bind(path)?)
}

/// Accepts connections forever, serving each one on its own task.
pub async fn serve<H: NotifyHandler>(listener: UnixListener, handler: Arc<H>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler).await {
                        debug!(error = %e, "notify connection ended");
                    }
                });
            }
            Err(e) => warn!(error = %e, "failed to accept notify connection"),
        }
    }
}

async fn serve_connection<H: NotifyHandler>(
    stream: UnixStream,
    handler: Arc<H>,
) -> Result<(), NotifyError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let request: Request = serde_json::from_slice(&frame?)?;
        let reply = match request {
            Request::Info => Reply::Info(InfoResponse {
                supported_notify_versions: handler.supported_versions(),
            }),
            Request::HandleDomainEvent(request) => {
                Reply::Response(handler.handle_domain_event(request).await)
            }
            Request::HandleK8sEvent(request) => {
                Reply::Response(handler.handle_k8s_event(request).await)
            }
        };
        framed.send(Bytes::from(serde_json::to_vec(&reply)?)).await?;
    }
    Ok(())
}
