/// Domain status model reported to the remote watcher.
///
/// A [`DomainSnapshot`] is rebuilt on every dispatch cycle from the domain's
/// composite `namespace_name` key and the VMI UID, then filled in from the
/// hypervisor and the guest agent before being serialized as JSON.
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

/// Namespace used when a domain key carries no `namespace_` prefix.
pub const DEFAULT_NAMESPACE: &str = "default";

/// User-assigned device aliases carry this prefix in the domain spec.
const USER_ALIAS_PREFIX: &str = "ua-";

/// Coarse status of a domain.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum LifeCycle {
    #[default]
    NoState,
    Running,
    Blocked,
    Paused,
    #[serde(rename = "ShuttingDown")]
    Shutdown,
    Shutoff,
    Crashed,
    #[serde(rename = "PMSuspended")]
    PmSuspended,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ShutdownReason {
    Unknown,
    User,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ShutoffReason {
    Unknown,
    Shutdown,
    Destroyed,
    Crashed,
    Migrated,
    Saved,
    Failed,
    FromSnapshot,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum CrashedReason {
    Unknown,
    Panicked,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum PausedReason {
    Unknown,
    User,
    Migration,
    Save,
    Dump,
    IoError,
    Watchdog,
    FromSnapshot,
    ShuttingDown,
    Snapshot,
    Crashed,
    StartingUp,
    Postcopy,
    PostcopyFailed,
}

/// Fine-grained reason qualifying a [`LifeCycle`].
///
/// Only the Shutdown, Shutoff, Crashed and Paused families carry their own
/// reasons. `NonExistent` marks a domain the hypervisor no longer knows about.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum StateChangeReason {
    #[default]
    Unknown,
    NonExistent,
    Shutdown(ShutdownReason),
    Shutoff(ShutoffReason),
    Crashed(CrashedReason),
    Paused(PausedReason),
}

impl StateChangeReason {
    /// Wire name of the reason. Families share names (e.g. `Unknown`).
    pub fn as_str(&self) -> &'static str {
        match self {
            StateChangeReason::Unknown => "Unknown",
            StateChangeReason::NonExistent => "NonExistent",
            StateChangeReason::Shutdown(r) => match r {
                ShutdownReason::Unknown => "Unknown",
                ShutdownReason::User => "User",
            },
            StateChangeReason::Shutoff(r) => match r {
                ShutoffReason::Unknown => "Unknown",
                ShutoffReason::Shutdown => "Shutdown",
                ShutoffReason::Destroyed => "Destroyed",
                ShutoffReason::Crashed => "Crashed",
                ShutoffReason::Migrated => "Migrated",
                ShutoffReason::Saved => "Saved",
                ShutoffReason::Failed => "Failed",
                ShutoffReason::FromSnapshot => "FromSnapshot",
            },
            StateChangeReason::Crashed(r) => match r {
                CrashedReason::Unknown => "Unknown",
                CrashedReason::Panicked => "Panicked",
            },
            StateChangeReason::Paused(r) => match r {
                PausedReason::Unknown => "Unknown",
                PausedReason::User => "User",
                PausedReason::Migration => "Migration",
                PausedReason::Save => "Save",
                PausedReason::Dump => "Dump",
                PausedReason::IoError => "IOError",
                PausedReason::Watchdog => "Watchdog",
                PausedReason::FromSnapshot => "FromSnapshot",
                PausedReason::ShuttingDown => "ShuttingDown",
                PausedReason::Snapshot => "Snapshot",
                PausedReason::Crashed => "Crashed",
                PausedReason::StartingUp => "StartingUp",
                PausedReason::Postcopy => "Postcopy",
                PausedReason::PostcopyFailed => "PostcopyFailed",
            },
        }
    }
}

impl Serialize for StateChangeReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for StateChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the VirtualMachineInstance this launcher runs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct VmiRef {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

impl VmiRef {
    /// Composite hypervisor domain name, `namespace_name`.
    pub fn domain_name(&self) -> String {
        domain_from_namespace_name(&self.namespace, &self.name)
    }
}

/// Launcher-owned metadata embedded into the domain spec.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct DomainMetadata {
    #[serde(default)]
    pub uid: String,
    /// Any further sections (migration, grace period, ...) are passed through.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct DiskSpec {
    /// Guest-visible target device, e.g. `vda`.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// The subset of the hypervisor's domain definition the watcher consumes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DomainMetadata>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interface_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub info_source: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GuestOsInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pretty_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_release: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct FsFreeze {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    pub status: LifeCycle,
    pub reason: StateChangeReason,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceStatus>,
    #[serde(rename = "guestOSInfo")]
    pub os_info: GuestOsInfo,
    pub fs_freeze_status: FsFreeze,
}

#[derive(Debug, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// RFC 3339 timestamp set once the hypervisor object is confirmed gone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
}

/// Observed state of the launcher's domain.
#[derive(Debug, Serialize, Clone, PartialEq, Default)]
pub struct DomainSnapshot {
    pub metadata: ObjectMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<DomainSpec>,
    pub status: DomainStatus,
}

impl DomainSnapshot {
    /// Builds an empty snapshot for the domain `key` owned by VMI `vmi_uid`.
    pub fn from_name(key: &str, vmi_uid: &str) -> Self {
        let (namespace, name) = split_namespace_key(key);
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                uid: vmi_uid.to_string(),
                deletion_timestamp: None,
            },
            spec: None,
            status: DomainStatus::default(),
        }
    }

    /// The composite hypervisor domain name for this snapshot.
    pub fn domain_key(&self) -> String {
        domain_from_namespace_name(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn set_state(&mut self, status: LifeCycle, reason: StateChangeReason) {
        self.status.status = status;
        self.status.reason = reason;
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Volume name of the disk attached at `target`, or an empty string when
    /// the spec is unknown or has no such disk.
    pub fn volume_name_by_target(&self, target: &str) -> String {
        self.spec
            .iter()
            .flat_map(|spec| spec.disks.iter())
            .find(|disk| disk.target == target)
            .and_then(|disk| disk.alias.as_deref())
            .map(|alias| alias.strip_prefix(USER_ALIAS_PREFIX).unwrap_or(alias).to_string())
            .unwrap_or_default()
    }
}

/// Splits a `namespace_name` domain key. Keys without `_` live in
/// [`DEFAULT_NAMESPACE`].
pub fn split_namespace_key(key: &str) -> (&str, &str) {
    match key.split_once('_') {
        Some((namespace, name)) => (namespace, name),
        None => (DEFAULT_NAMESPACE, key),
    }
}

pub fn domain_from_namespace_name(namespace: &str, name: &str) -> String {
    format!("{namespace}_{name}")
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
