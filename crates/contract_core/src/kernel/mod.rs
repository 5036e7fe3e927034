//! Contract kernel facility and process launcher contracts.
//!
//! # Responsibility
//! - Define the facility interface the core drives: contract allocation,
//!   template scope, activation, event reads, acknowledgment, signalling and
//!   abandonment.
//! - Define the process launcher seam used inside a template scope.
//!
//! # Invariants
//! - Facilities deliver events for one contract in increasing evid order.
//! - Facilities report membership emptiness reliably through `status`.
//!
//! # See also
//! - `kernel::sim` for the in-process facility used by tests and demos.

use crate::model::event::{Ctid, Event, EventClass, Evid, Pid};
use crate::model::status::ContractState;
use crate::model::template::Template;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub mod sim;

pub type KernelResult<T> = Result<T, KernelError>;

/// Access level requested when binding to an existing contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Write access: acknowledge, signal, abandon.
    Control,
    /// Read-only access: status and events.
    Observe,
}

/// Facility-side view of one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelStatus {
    pub ctid: Ctid,
    pub state: ContractState,
    pub template: Template,
    pub members: Vec<Pid>,
    pub outstanding: usize,
    pub quiesced: usize,
    pub last_evid: Evid,
}

/// Kernel facility that owns contract objects.
///
/// Implementations must be safe to call from the dispatcher thread and from
/// application threads concurrently.
pub trait ContractKernel: Send + Sync {
    /// Allocates a new, unactivated contract held by the calling process.
    fn create(&self, template: &Template) -> KernelResult<Ctid>;
    /// Opens an existing contract with the requested access.
    fn open(&self, ctid: Ctid, access: Access) -> KernelResult<()>;
    /// Returns the most recently created contract, waiting up to `timeout`
    /// for one to register.
    fn latest(&self, timeout: Duration) -> KernelResult<Option<Ctid>>;
    /// Installs the template used for the next spawned processes.
    fn set_template(&self, template: &Template) -> KernelResult<()>;
    fn clear_template(&self) -> KernelResult<()>;
    /// Marks `ctid` as the contract new children are enrolled into.
    fn activate(&self, ctid: Ctid) -> KernelResult<()>;
    fn deactivate(&self, ctid: Ctid) -> KernelResult<()>;
    /// Returns the first event of `ctid` with an evid greater than `after`,
    /// waiting up to `timeout`. `Ok(None)` means nothing arrived in time.
    fn read_event(&self, ctid: Ctid, after: Evid, timeout: Duration)
        -> KernelResult<Option<Event>>;
    /// Class of an event posted on `ctid`; `None` when `evid` was never
    /// posted there.
    fn event_class(&self, ctid: Ctid, evid: Evid) -> KernelResult<Option<EventClass>>;
    fn ack(&self, ctid: Ctid, evid: Evid) -> KernelResult<()>;
    fn nack(&self, ctid: Ctid, evid: Evid) -> KernelResult<()>;
    fn qack(&self, ctid: Ctid, evid: Evid) -> KernelResult<()>;
    fn status(&self, ctid: Ctid) -> KernelResult<KernelStatus>;
    /// Delivers `signal` to every member of `ctid`.
    fn signal(&self, ctid: Ctid, signal: i32) -> KernelResult<()>;
    /// Gives up the caller's hold on `ctid`.
    fn abandon(&self, ctid: Ctid) -> KernelResult<()>;
}

/// Facility rejections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    NotFound(Ctid),
    PermissionDenied(Ctid),
    /// Transient conflict; retrying later may succeed.
    Busy(String),
    Rejected(String),
}

impl KernelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(ctid) => write!(f, "contract not found: {ctid}"),
            Self::PermissionDenied(ctid) => write!(f, "permission denied on contract {ctid}"),
            Self::Busy(message) => write!(f, "facility busy: {message}"),
            Self::Rejected(message) => write!(f, "facility rejected request: {message}"),
        }
    }
}

impl Error for KernelError {}

/// Process spawn request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// Process spawn primitive.
///
/// Spawning while a template scope is active enrolls the child into a fresh
/// contract configured per that template.
pub trait ProcessLauncher {
    fn spawn(&self, request: &LaunchRequest) -> Result<Pid, LaunchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    EmptyProgram,
    Failed(String),
}

impl Display for LaunchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyProgram => write!(f, "launch program must not be empty"),
            Self::Failed(message) => write!(f, "launch failed: {message}"),
        }
    }
}

impl Error for LaunchError {}
