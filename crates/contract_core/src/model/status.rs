//! Point-in-time contract status.

use crate::model::event::{Ctid, EventKind, Evid, Pid};
use crate::model::template::{ContractType, TemplateParam};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Holder relationship between the contract and the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    /// Held by the process that created it.
    Owned,
    /// Held after being adopted from an orphaned holder.
    Inherited,
    /// Holder abandoned it; members remain and it may be adopted.
    Orphan,
    /// Abandoned with no adoptable future; destroyed once empty.
    Dead,
}

/// Immutable status view produced on demand by `ContractHandle::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub ctid: Ctid,
    pub contract_type: ContractType,
    pub state: ContractState,
    /// Current member pids, ascending.
    pub members: Vec<Pid>,
    pub critical: BTreeSet<EventKind>,
    pub informative: BTreeSet<EventKind>,
    pub params: BTreeSet<TemplateParam>,
    pub cookie: u64,
    /// Critical events the facility still holds unacknowledged.
    pub outstanding: usize,
    /// Critical events quiesced with `qack` and not yet released.
    pub quiesced: usize,
    /// Highest evid produced for this contract, `0` before the first event.
    pub last_evid: Evid,
    /// Whether the observing handle is the activated contract.
    pub active: bool,
}

impl StatusSnapshot {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// No critical event is outstanding or quiesced.
    pub fn is_fully_acknowledged(&self) -> bool {
        self.outstanding == 0 && self.quiesced == 0
    }
}
