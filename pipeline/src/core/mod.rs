//! Pure, deterministic pipeline logic: classification, step selection,
//! status transitions, invariants, statistics. No I/O.

pub mod classify;
pub mod invariants;
pub mod registry;
pub mod stats;
pub mod transitions;
