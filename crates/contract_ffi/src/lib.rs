//! FRB-facing bindings over `contract_core`.

pub mod api;
