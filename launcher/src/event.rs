use serde::Serialize;

use crate::domain::{DomainSnapshot, FsFreeze, GuestOsInfo, InterfaceStatus};

/// Detail code of a `Defined` lifecycle event for a newly added domain.
pub const DEFINED_DETAIL_ADDED: i32 = 0;
/// Detail code of a `Started` lifecycle event for an incoming migration.
pub const STARTED_DETAIL_MIGRATED: i32 = 1;

/// Hypervisor lifecycle event codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEventKind {
    Defined = 0,
    Undefined = 1,
    Started = 2,
    Suspended = 3,
    Resumed = 4,
    Stopped = 5,
    Shutdown = 6,
    PmSuspended = 7,
    Crashed = 8,
}

/// A raw lifecycle callback: event code plus its event-specific detail code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub detail: i32,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleEventKind, detail: i32) -> Self {
        Self { kind, detail }
    }

    /// True for the events that make a domain appear to the watcher: a fresh
    /// definition or the arrival of an incoming migration.
    pub fn announces_domain(&self) -> bool {
        matches!(
            (self.kind, self.detail),
            (LifecycleEventKind::Defined, DEFINED_DETAIL_ADDED)
                | (LifecycleEventKind::Started, STARTED_DETAIL_MIGRATED)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentLifecycleEvent {
    pub state: AgentState,
    pub reason: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HypervisorEventKind {
    Lifecycle(LifecycleEvent),
    DeviceAdded,
    DeviceRemoved,
    MemoryDeviceSizeChange,
    AgentLifecycle(AgentLifecycleEvent),
}

/// A callback from the hypervisor daemon, reduced to what the dispatch loop
/// needs: the affected domain and the event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct HypervisorEvent {
    /// Domain name as reported by the hypervisor. Empty if it could not be read.
    pub domain: String,
    pub kind: HypervisorEventKind,
}

impl HypervisorEvent {
    pub fn lifecycle(&self) -> Option<&LifecycleEvent> {
        match &self.kind {
            HypervisorEventKind::Lifecycle(event) => Some(event),
            _ => None,
        }
    }
}

/// Guest information published by the agent poller. Each update replaces the
/// previous one as a whole; `None` fields were not reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUpdate {
    pub interfaces: Option<Vec<InterfaceStatus>>,
    pub os_info: Option<GuestOsInfo>,
    pub fs_freeze_status: Option<FsFreeze>,
}

/// Failure payload carried by [`DomainEvent::Error`].
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FailureStatus {
    pub status: &'static str,
    pub message: String,
}

impl FailureStatus {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "Failure",
            message: message.into(),
        }
    }
}

/// Watch-style notification sent to the remote watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Added(DomainSnapshot),
    Modified(DomainSnapshot),
    Error(FailureStatus),
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::Added(_) => "ADDED",
            DomainEvent::Modified(_) => "MODIFIED",
            DomainEvent::Error(_) => "ERROR",
        }
    }

    pub fn domain(&self) -> Option<&DomainSnapshot> {
        match self {
            DomainEvent::Added(d) | DomainEvent::Modified(d) => Some(d),
            DomainEvent::Error(_) => None,
        }
    }
}

/// Events consumed by the launcher binary's main loop.
pub enum LauncherEvent {
    /// A VMM process for the domain appeared in the process list.
    VmmStarted { pid: u32, name: String },
    /// The previously seen VMM process exited.
    VmmExited { pid: u32 },
    /// Ctrl+C received; supervisors should be stopped and the launcher exit.
    Shutdown,
}
