//! Hypervisor API models
//!
//! Run states and lifecycle event codes use libvirt's numbering
//! (`virDomainState`, `virDomainEventType`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Run state of a domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DomainRunState {
    #[default]
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    #[serde(rename = "pmsuspended")]
    PMSuspended,
}

/// Domain as returned by `GET /v1/domains[/{name}]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub uuid: String,
    #[serde(default)]
    pub state: DomainRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_kib: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,
}

impl DomainInfo {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>, state: DomainRunState) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
            state,
            emulator: None,
            memory_kib: None,
            vcpus: None,
        }
    }
}

/// Domain lifecycle event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEventCode {
    Defined,
    Undefined,
    Started,
    Suspended,
    Resumed,
    Stopped,
    Shutdown,
    PMSuspended,
    Crashed,
}

impl LifecycleEventCode {
    /// Maps a wire code to an event type; unknown codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Defined,
            1 => Self::Undefined,
            2 => Self::Started,
            3 => Self::Suspended,
            4 => Self::Resumed,
            5 => Self::Stopped,
            6 => Self::Shutdown,
            7 => Self::PMSuspended,
            8 => Self::Crashed,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Defined => 0,
            Self::Undefined => 1,
            Self::Started => 2,
            Self::Suspended => 3,
            Self::Resumed => 4,
            Self::Stopped => 5,
            Self::Shutdown => 6,
            Self::PMSuspended => 7,
            Self::Crashed => 8,
        }
    }
}

impl fmt::Display for LifecycleEventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub name: String,
    pub uuid: String,
    pub code: LifecycleEventCode,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>, code: LifecycleEventCode) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
            code,
            timestamp: Utc::now(),
        }
    }
}

/// Raw event record from `GET /v1/events`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLifecycleEvent {
    pub seq: u64,
    pub domain: String,
    pub uuid: String,
    pub event: i32,
    #[serde(default)]
    pub detail: i32,
    pub timestamp: DateTime<Utc>,
}

impl RawLifecycleEvent {
    /// Converts to a typed event; `None` for event codes this client does not know.
    pub fn into_event(self) -> Option<DomainEvent> {
        let code = LifecycleEventCode::from_code(self.event)?;
        Some(DomainEvent {
            name: self.domain,
            uuid: self.uuid,
            code,
            timestamp: self.timestamp,
        })
    }
}

/// Response of `GET /v1/events?after=N`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(default)]
    pub events: Vec<RawLifecycleEvent>,
    /// Sequence number to resume from.
    pub cursor: u64,
}

/// Response of `GET /v1/events/cursor`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EventCursor {
    pub cursor: u64,
}

/// Response of `GET /v1/domains`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainList {
    #[serde(default)]
    pub domains: Vec<DomainInfo>,
}
