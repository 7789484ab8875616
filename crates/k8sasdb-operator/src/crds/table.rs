//! Table CRD
//!
//! Defines the Table custom resource: a named tabular schema whose columns
//! become the fields of a generated CustomResourceDefinition.

use kube::runtime::reflector::ObjectRef;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Table describes a user-defined schema.
///
/// Every Table gets a derived CRD exposing it as its own resource type,
/// e.g. a Table named `orders` yields `orderss.user.k8sasdb.org`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "db.k8sasdb.org",
    version = "v1",
    kind = "Table",
    namespaced,
    status = "TableStatus",
    printcolumn = r#"{"name":"Group", "type":"string", "jsonPath":".spec.customGroup"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    /// Ordered column definitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnSpec>,

    /// Group override for the derived CRD. Only used when the operator
    /// runs with `--honor-custom-group`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_group: Option<String>,
}

/// A single typed column.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,

    /// OpenAPI type tag (`string`, `integer`, `number`, `boolean`, ...).
    /// Passed through verbatim.
    #[serde(rename = "type")]
    pub column_type: String,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
        }
    }
}

/// Observed state of a Table. Nothing is reported yet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TableStatus {}

/// Cluster-wide identity of a Table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    pub namespace: String,
    pub name: String,
}

impl TableKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Reference used to enqueue the Table in the controller.
    pub fn object_ref(&self) -> ObjectRef<Table> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl From<&Table> for TableKey {
    fn from(table: &Table) -> Self {
        Self::new(table.namespace().unwrap_or_default(), table.name_any())
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
