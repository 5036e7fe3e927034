//! Process contract lifecycle core.
//!
//! Binds to kernel-managed process contracts, scopes templates around
//! process spawns, streams contract events to listeners and enforces the
//! ack/nack/qack protocol.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod kernel;
pub mod logging;
pub mod manager;
pub mod model;
pub mod protocol;
pub mod scope;

pub use config::ContractConfig;
pub use dispatch::{CloseReason, Delivery, ListenerId, Subscription};
pub use error::{ContractError, ContractResult};
pub use handle::{ContractHandle, HandleOrigin};
pub use kernel::sim::SimKernel;
pub use kernel::{
    Access, ContractKernel, KernelError, KernelResult, KernelStatus, LaunchError, LaunchRequest,
    ProcessLauncher,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use manager::ContractManager;
pub use model::event::{
    parse_event_kind, Ctid, Event, EventClass, EventKind, EventKindError, EventPayload, Evid, Pid,
    UNBOUND_CTID,
};
pub use model::status::{ContractState, StatusSnapshot};
pub use model::template::{ContractType, Template, TemplateParam, TemplateValidationError};
pub use protocol::ack::AckKind;
pub use scope::TemplateScope;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
