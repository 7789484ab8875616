//! Kubernetes controllers
//!
//! Reconciler that watches Tables and keeps their derived CRDs in place.

mod context;
mod table;

pub use context::Context;
pub use table::{ApplyOutcome, Outcome, ReconcileError, Reconciler, TableController};
