//! Contract domain model.
//!
//! # Responsibility
//! - Define identifiers, event kinds and events delivered by the facility.
//! - Define templates that scope event classification for new contracts.
//! - Define immutable status snapshots.
//!
//! # Invariants
//! - `Ctid` value `0` is the unbound sentinel and never names a contract.
//! - Evids are strictly increasing within one contract.
//! - A template never lists the same event kind as both critical and
//!   informative.

pub mod event;
pub mod status;
pub mod template;
