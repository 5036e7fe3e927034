//! Contract event model.
//!
//! # Responsibility
//! - Name every event kind the facility can deliver, with stable string ids.
//! - Carry one delivered event with its class, cookie and payload.
//!
//! # Invariants
//! - `evid` is unique within one `ctid` and increases with delivery order.
//! - `class` is decided by the template that produced the contract.

use crate::model::template::ContractType;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Kernel-assigned contract identifier.
pub type Ctid = u64;
/// Per-contract event identifier used for acknowledgment.
pub type Evid = u64;
/// Process identifier of a contract member.
pub type Pid = u32;

/// Sentinel id of a handle that is not bound to any contract.
pub const UNBOUND_CTID: Ctid = 0;

/// Event kind string for process contract membership becoming empty.
pub const EVENT_PR_EMPTY: &str = "pr_empty";
/// Event kind string for a member forking a new member.
pub const EVENT_PR_FORK: &str = "pr_fork";
/// Event kind string for a member exiting.
pub const EVENT_PR_EXIT: &str = "pr_exit";
/// Event kind string for a member dumping core.
pub const EVENT_PR_CORE: &str = "pr_core";
/// Event kind string for a member receiving a fatal signal.
pub const EVENT_PR_SIGNAL: &str = "pr_signal";
/// Event kind string for a member hitting an uncorrectable hardware error.
pub const EVENT_PR_HWERR: &str = "pr_hwerr";
/// Event kind string for a device coming online.
pub const EVENT_DEV_ONLINE: &str = "dev_online";
/// Event kind string for a device degrading.
pub const EVENT_DEV_DEGRADED: &str = "dev_degraded";
/// Event kind string for a device going offline.
pub const EVENT_DEV_OFFLINE: &str = "dev_offline";
/// Event kind string for the end of a negotiation.
pub const EVENT_NEGEND: &str = "negend";

const SUPPORTED_EVENT_KIND_STRINGS: &[&str] = &[
    EVENT_PR_EMPTY,
    EVENT_PR_FORK,
    EVENT_PR_EXIT,
    EVENT_PR_CORE,
    EVENT_PR_SIGNAL,
    EVENT_PR_HWERR,
    EVENT_DEV_ONLINE,
    EVENT_DEV_DEGRADED,
    EVENT_DEV_OFFLINE,
    EVENT_NEGEND,
];

/// Returns every supported event kind string.
pub fn supported_event_kind_strings() -> &'static [&'static str] {
    SUPPORTED_EVENT_KIND_STRINGS
}

/// Lifecycle transition reported by a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "pr_empty")]
    ProcessEmpty,
    #[serde(rename = "pr_fork")]
    ProcessFork,
    #[serde(rename = "pr_exit")]
    ProcessExit,
    #[serde(rename = "pr_core")]
    ProcessCore,
    #[serde(rename = "pr_signal")]
    ProcessSignal,
    #[serde(rename = "pr_hwerr")]
    ProcessHwErr,
    #[serde(rename = "dev_online")]
    DeviceOnline,
    #[serde(rename = "dev_degraded")]
    DeviceDegraded,
    #[serde(rename = "dev_offline")]
    DeviceOffline,
    #[serde(rename = "negend")]
    NegotiationEnd,
}

impl EventKind {
    /// Stable string id used in templates and delivered events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessEmpty => EVENT_PR_EMPTY,
            Self::ProcessFork => EVENT_PR_FORK,
            Self::ProcessExit => EVENT_PR_EXIT,
            Self::ProcessCore => EVENT_PR_CORE,
            Self::ProcessSignal => EVENT_PR_SIGNAL,
            Self::ProcessHwErr => EVENT_PR_HWERR,
            Self::DeviceOnline => EVENT_DEV_ONLINE,
            Self::DeviceDegraded => EVENT_DEV_DEGRADED,
            Self::DeviceOffline => EVENT_DEV_OFFLINE,
            Self::NegotiationEnd => EVENT_NEGEND,
        }
    }

    /// Contract domain this kind belongs to.
    ///
    /// `None` means the kind is common to every domain.
    pub fn domain(self) -> Option<ContractType> {
        match self {
            Self::ProcessEmpty
            | Self::ProcessFork
            | Self::ProcessExit
            | Self::ProcessCore
            | Self::ProcessSignal
            | Self::ProcessHwErr => Some(ContractType::Process),
            Self::DeviceOnline | Self::DeviceDegraded | Self::DeviceOffline => {
                Some(ContractType::Device)
            }
            Self::NegotiationEnd => None,
        }
    }

    /// Returns whether this kind may appear in a template of `contract_type`.
    pub fn belongs_to(self, contract_type: ContractType) -> bool {
        self.domain().map_or(true, |domain| domain == contract_type)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses one event kind from its string id.
pub fn parse_event_kind(value: &str) -> Result<EventKind, EventKindError> {
    let normalized = value.trim();
    if normalized.is_empty() {
        return Err(EventKindError::EmptyKind);
    }

    match normalized {
        EVENT_PR_EMPTY => Ok(EventKind::ProcessEmpty),
        EVENT_PR_FORK => Ok(EventKind::ProcessFork),
        EVENT_PR_EXIT => Ok(EventKind::ProcessExit),
        EVENT_PR_CORE => Ok(EventKind::ProcessCore),
        EVENT_PR_SIGNAL => Ok(EventKind::ProcessSignal),
        EVENT_PR_HWERR => Ok(EventKind::ProcessHwErr),
        EVENT_DEV_ONLINE => Ok(EventKind::DeviceOnline),
        EVENT_DEV_DEGRADED => Ok(EventKind::DeviceDegraded),
        EVENT_DEV_OFFLINE => Ok(EventKind::DeviceOffline),
        EVENT_NEGEND => Ok(EventKind::NegotiationEnd),
        other => Err(EventKindError::UnsupportedKind(other.to_string())),
    }
}

/// Event kind parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKindError {
    EmptyKind,
    UnsupportedKind(String),
}

impl Display for EventKindError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyKind => write!(f, "event kind must not be empty"),
            Self::UnsupportedKind(value) => write!(f, "event kind is unsupported: {value}"),
        }
    }
}

impl Error for EventKindError {}

/// Delivery class of an event, fixed by the producing template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    /// Holds the contract non-empty until acknowledged.
    Critical,
    /// Best-effort notification; acknowledgment is optional.
    Informative,
}

/// Kind-specific event data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Last member left the contract.
    Empty,
    /// `pid` was forked by `ppid` into the contract.
    Fork { pid: Pid, ppid: Pid },
    /// `pid` exited with `status`.
    Exit { pid: Pid, status: i32 },
    /// `pid` dumped core.
    Core { pid: Pid },
    /// `pid` received fatal `signal`.
    Signal { pid: Pid, signal: i32 },
    /// `pid` was killed by an uncorrectable hardware error.
    HwErr { pid: Pid },
    /// Device contract state transition.
    Device { path: String },
    /// A negotiation completed.
    Negotiation,
}

impl EventPayload {
    /// Returns the member pid the payload refers to, if any.
    pub fn pid(&self) -> Option<Pid> {
        match self {
            Self::Fork { pid, .. }
            | Self::Exit { pid, .. }
            | Self::Core { pid }
            | Self::Signal { pid, .. }
            | Self::HwErr { pid } => Some(*pid),
            Self::Empty | Self::Device { .. } | Self::Negotiation => None,
        }
    }
}

/// One event delivered for a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Contract this event belongs to.
    pub ctid: Ctid,
    /// Acknowledgment id, unique within `ctid`.
    pub evid: Evid,
    pub kind: EventKind,
    pub class: EventClass,
    /// Template cookie, round-tripped unchanged.
    pub cookie: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn is_critical(&self) -> bool {
        self.class == EventClass::Critical
    }
}
