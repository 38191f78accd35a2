/// Interface to the hypervisor daemon's domain queries.
///
/// The launcher never owns the hypervisor binding; it is handed a
/// [`DomainConnection`] and only looks domains up, reads their state, their
/// runtime spec and their disk errors.
use async_trait::async_trait;

use crate::domain::DomainSpec;
use crate::translate::DomainState;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// The domain does not exist (any more).
    #[error("domain not found")]
    NotFound,
    /// The query is not allowed in the domain's current state, e.g. reading
    /// metadata while the domain is migrating.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("{0}")]
    Other(String),
}

impl QueryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueryError::NotFound)
    }

    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, QueryError::InvalidOperation(_))
    }
}

/// Error state of one disk, as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskErrorCode {
    None,
    Unspecified,
    NoSpace,
    Unrecognized(i32),
}

impl From<i32> for DiskErrorCode {
    fn from(code: i32) -> Self {
        match code {
            0 => DiskErrorCode::None,
            1 => DiskErrorCode::Unspecified,
            2 => DiskErrorCode::NoSpace,
            other => DiskErrorCode::Unrecognized(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskError {
    /// Target device of the disk, e.g. `vda`.
    pub target: String,
    pub error: DiskErrorCode,
}

#[async_trait]
pub trait DomainHandle: Send + Sync {
    /// Current state and the raw, state-specific reason code.
    async fn get_state(&self) -> Result<(DomainState, i32), QueryError>;
    /// Active domain definition including runtime information.
    async fn get_spec_with_runtime_info(&self) -> Result<DomainSpec, QueryError>;
    async fn get_disk_errors(&self) -> Result<Vec<DiskError>, QueryError>;
}

#[async_trait]
pub trait DomainConnection: Send + Sync {
    type Handle: DomainHandle;

    async fn lookup_by_name(&self, name: &str) -> Result<Self::Handle, QueryError>;
}
