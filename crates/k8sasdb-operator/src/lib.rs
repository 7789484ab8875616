//! k8sasdb Operator Library
//!
//! Kubernetes operator that exposes user-defined tables as resource types.
//! Each `Table` resource describes a schema; the operator derives a
//! CustomResourceDefinition from it and keeps that CRD owned by the Table,
//! so deleting the Table garbage-collects the CRD.

pub mod cluster;
pub mod config;
pub mod controllers;
pub mod crds;
pub mod index;
pub mod synth;
pub mod telemetry;

pub use crds::{ColumnSpec, Table, TableKey, TableSpec};
pub use synth::{synthesize, SynthesisConfig, SynthesisError};
