/// Messages exchanged with the remote watcher.
///
/// Payloads are JSON documents carried as opaque strings; the envelopes
/// themselves are JSON and travel in length-delimited frames.
use serde::{Deserialize, Serialize};

use crate::domain::VmiRef;

/// Notify protocol versions this client implements.
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub supported_notify_versions: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainEventRequest {
    /// Serialized domain snapshot; empty for error events.
    pub domain_json: String,
    /// Serialized failure status; empty for domain events.
    pub status_json: String,
    pub event_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct K8sEventRequest {
    pub event_json: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Response {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    Info,
    HandleDomainEvent(DomainEventRequest),
    HandleK8sEvent(K8sEventRequest),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "body")]
pub enum Reply {
    Info(InfoResponse),
    Response(Response),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ObjectReference {
    pub fn for_vmi(vmi: &VmiRef) -> Self {
        Self {
            kind: "VirtualMachineInstance".to_string(),
            api_version: "kubevirt.io/v1".to_string(),
            namespace: vmi.namespace.clone(),
            name: vmi.name.clone(),
            uid: vmi.uid.clone(),
        }
    }
}

/// Advisory event recorded against the VMI by the watcher.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct K8sEvent {
    pub involved_object: ObjectReference,
    #[serde(rename = "type")]
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}
