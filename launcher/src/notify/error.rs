use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to dial notify socket {}: {source}", path.display())]
    Dial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out dialing notify socket {}", path.display())]
    DialTimeout { path: PathBuf },
    #[error("could not check notify server version: {0}")]
    Info(#[source] Box<NotifyError>),
    #[error("no compatible version found, server: {server:?}, client: {client:?}")]
    NoCompatibleVersion { server: Vec<u32>, client: Vec<u32> },
    #[error("notify client version {0} not implemented yet")]
    VersionNotImplemented(u32),
    #[error("notify request timed out after {0:?}")]
    Timeout(Duration),
    #[error("notify connection closed by peer")]
    ConnectionClosed,
    #[error("unexpected reply to {0} request")]
    UnexpectedReply(&'static str),
    #[error("failed to notify {kind} event: {message}")]
    Rejected { kind: &'static str, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
