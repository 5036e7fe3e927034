//! Core error taxonomy.
//!
//! # Responsibility
//! - Give every misuse and facility rejection a distinct, matchable kind.
//! - Let callers tell retry-safe conditions from programmer errors.
//!
//! # Invariants
//! - Facility rejections are never swallowed; they map to
//!   `PermissionDenied` or `KernelRejected`.

use crate::kernel::KernelError;
use crate::model::event::{Ctid, Evid};
use crate::model::template::TemplateValidationError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ContractResult<T> = Result<T, ContractError>;

/// Errors returned by lifecycle, scope, handle and acknowledgment APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    /// Template failed validation.
    InvalidTemplate(TemplateValidationError),
    /// A template scope is already set for this process.
    ScopeAlreadyActive,
    /// `clear_template` was called with no scope set.
    NoActiveScope,
    /// No contract is visible yet (retry after the spawn completes).
    NoContract,
    /// The facility refused write access to the contract.
    PermissionDenied(Ctid),
    /// The operation needs write access but the handle only observes.
    NotOwner(Ctid),
    /// The facility refused the request.
    KernelRejected {
        operation: &'static str,
        source: KernelError,
    },
    /// The evid is not an outstanding event of this handle.
    UnknownEvent { ctid: Ctid, evid: Evid },
    /// The handle is not in a state that allows the operation.
    InvalidState(&'static str),
    /// The contract has no members left.
    EmptyContract(Ctid),
    /// The handle was abandoned.
    HandleAbandoned,
    /// `abandon` was called on an already abandoned handle.
    AlreadyAbandoned,
}

impl ContractError {
    /// Maps a facility error raised by `operation`.
    pub fn kernel(operation: &'static str, source: KernelError) -> Self {
        match source {
            KernelError::PermissionDenied(ctid) => Self::PermissionDenied(ctid),
            source => Self::KernelRejected { operation, source },
        }
    }

    /// Stable machine-readable code, used in logs and FFI envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTemplate(_) => "invalid_template",
            Self::ScopeAlreadyActive => "scope_already_active",
            Self::NoActiveScope => "no_active_scope",
            Self::NoContract => "no_contract",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotOwner(_) => "not_owner",
            Self::KernelRejected { .. } => "kernel_rejected",
            Self::UnknownEvent { .. } => "unknown_event",
            Self::InvalidState(_) => "invalid_state",
            Self::EmptyContract(_) => "empty_contract",
            Self::HandleAbandoned => "handle_abandoned",
            Self::AlreadyAbandoned => "already_abandoned",
        }
    }

    /// Returns whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoContract => true,
            Self::KernelRejected { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl Display for ContractError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTemplate(err) => write!(f, "invalid template: {err}"),
            Self::ScopeAlreadyActive => write!(f, "a template scope is already active"),
            Self::NoActiveScope => write!(f, "no template scope is active"),
            Self::NoContract => write!(f, "no contract is available"),
            Self::PermissionDenied(ctid) => {
                write!(f, "permission denied for contract {ctid}")
            }
            Self::NotOwner(ctid) => write!(f, "handle only observes contract {ctid}"),
            Self::KernelRejected { operation, source } => {
                write!(f, "kernel rejected {operation}: {source}")
            }
            Self::UnknownEvent { ctid, evid } => {
                write!(f, "event {evid} is not outstanding on contract {ctid}")
            }
            Self::InvalidState(details) => write!(f, "invalid handle state: {details}"),
            Self::EmptyContract(ctid) => write!(f, "contract {ctid} has no members"),
            Self::HandleAbandoned => write!(f, "contract handle has been abandoned"),
            Self::AlreadyAbandoned => write!(f, "contract handle was already abandoned"),
        }
    }
}

impl Error for ContractError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidTemplate(err) => Some(err),
            Self::KernelRejected { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<KernelError> for ContractError {
    fn from(value: KernelError) -> Self {
        Self::kernel("kernel", value)
    }
}

impl From<TemplateValidationError> for ContractError {
    fn from(value: TemplateValidationError) -> Self {
        Self::InvalidTemplate(value)
    }
}

#[cfg(test)]
mod tests {
    use super::ContractError;
    use crate::kernel::KernelError;

    #[test]
    fn maps_permission_denied_to_its_own_kind() {
        assert_eq!(
            ContractError::kernel("adopt", KernelError::PermissionDenied(4)),
            ContractError::PermissionDenied(4)
        );
        assert!(matches!(
            ContractError::kernel("adopt", KernelError::NotFound(4)),
            ContractError::KernelRejected {
                operation: "adopt",
                ..
            }
        ));
    }

    #[test]
    fn distinguishes_retryable_from_programmer_errors() {
        assert!(ContractError::NoContract.is_retryable());
        assert!(ContractError::kernel("activate", KernelError::Busy("x".to_string())).is_retryable());
        assert!(!ContractError::AlreadyAbandoned.is_retryable());
        assert!(!ContractError::UnknownEvent { ctid: 1, evid: 2 }.is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ContractError::HandleAbandoned.code(), "handle_abandoned");
        assert_eq!(ContractError::ScopeAlreadyActive.code(), "scope_already_active");
    }
}
