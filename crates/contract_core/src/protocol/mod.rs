//! Event acknowledgment protocol.
//!
//! # Responsibility
//! - Name the three terminal responses a consumer issues per critical event.
//! - Track, per handle, which evids are outstanding and which were
//!   informative, so misuse is detected before reaching the facility.
//!
//! # Invariants
//! - Exactly one terminal response is accepted per outstanding critical evid.
//! - Responses to informative evids are idempotent no-ops.

pub mod ack;
