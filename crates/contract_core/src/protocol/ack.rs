//! Acknowledgment kinds and the per-handle ledger.

use crate::model::event::{Event, EventClass, EventKind, Evid};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

/// Terminal response to a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    /// Accept the event; the facility advances past it.
    Ack,
    /// Negative acknowledgment; the facility applies its own policy.
    Nack,
    /// Acknowledge and quiesce; the facility keeps holding the contract
    /// until a later `Ack` or abandonment.
    Qack,
}

impl AckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::Qack => "qack",
        }
    }
}

impl Display for AckKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a response to one evid must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Critical and outstanding: forward to the facility, then retire.
    Outstanding(EventKind),
    /// Informative: accept without contacting the facility.
    Informative,
}

/// Per-handle record of delivered events awaiting a response.
///
/// Only the newest `history_limit` informative evids are kept; older ones
/// are resolved against the facility.
#[derive(Debug)]
pub struct AckLedger {
    outstanding: BTreeMap<Evid, EventKind>,
    informative: BTreeSet<Evid>,
    history_limit: usize,
    last_recorded: Evid,
}

impl AckLedger {
    pub fn new(history_limit: usize) -> Self {
        Self {
            outstanding: BTreeMap::new(),
            informative: BTreeSet::new(),
            history_limit,
            last_recorded: 0,
        }
    }

    /// Records a delivered event.
    ///
    /// Returns `false` (and records nothing) when `event.evid` is not newer
    /// than the last recorded evid.
    pub fn record(&mut self, event: &Event) -> bool {
        if event.evid <= self.last_recorded {
            return false;
        }
        self.last_recorded = event.evid;

        match event.class {
            EventClass::Critical => {
                self.outstanding.insert(event.evid, event.kind);
            }
            EventClass::Informative => {
                self.informative.insert(event.evid);
                while self.informative.len() > self.history_limit {
                    self.informative.pop_first();
                }
            }
        }
        true
    }

    /// Classifies a response to `evid` without changing the ledger.
    pub fn disposition(&self, evid: Evid) -> Option<Disposition> {
        if let Some(kind) = self.outstanding.get(&evid) {
            return Some(Disposition::Outstanding(*kind));
        }
        if self.informative.contains(&evid) {
            return Some(Disposition::Informative);
        }
        None
    }

    /// Retires an outstanding evid after the facility accepted a response.
    pub fn retire(&mut self, evid: Evid) -> Option<EventKind> {
        self.outstanding.remove(&evid)
    }

    /// Outstanding critical evids, ascending.
    pub fn outstanding(&self) -> Vec<Evid> {
        self.outstanding.keys().copied().collect()
    }

    /// Whether `evid` is at or below the newest recorded evid, so it was
    /// delivered even if its entry has since been retired or evicted.
    pub fn covers(&self, evid: Evid) -> bool {
        evid != 0 && evid <= self.last_recorded
    }

    pub fn last_recorded(&self) -> Evid {
        self.last_recorded
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.informative.clear();
    }
}
