//! Custom Resource Definitions
//!
//! The Table resource consumed by the operator.

pub mod table;

pub use table::{ColumnSpec, Table, TableKey, TableSpec, TableStatus};
