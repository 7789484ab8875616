//! CRD synthesis
//!
//! Turns a [`Table`] into the CustomResourceDefinition that exposes it as a
//! resource type. Everything here is pure: no client, no I/O.

use crate::crds::{ColumnSpec, Table, TableKey};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceValidation,
    JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use thiserror::Error;

/// Group used for derived CRDs unless overridden.
pub const DEFAULT_GROUP: &str = "user.k8sasdb.org";

/// Version served by every derived CRD.
pub const DERIVED_VERSION: &str = "v1";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "k8sasdb-operator";
pub const TABLE_NAMESPACE_LABEL: &str = "db.k8sasdb.org/table-namespace";
pub const TABLE_NAME_LABEL: &str = "db.k8sasdb.org/table-name";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("cannot build controller reference for Table {table}: name or uid missing")]
    OwnerReference { table: TableKey },
}

/// Knobs for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisConfig {
    /// Group of every derived CRD.
    pub group: String,
    /// Let a non-empty `spec.customGroup` replace `group`.
    pub honor_custom_group: bool,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            honor_custom_group: false,
        }
    }
}

impl SynthesisConfig {
    /// Group the given Table's CRD lands in.
    pub fn group_for<'a>(&'a self, table: &'a Table) -> &'a str {
        match table.spec.custom_group.as_deref() {
            Some(custom) if self.honor_custom_group && !custom.is_empty() => custom,
            _ => &self.group,
        }
    }
}

/// Names registered by a derived CRD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedNames {
    pub crd_name: String,
    pub plural: String,
    pub singular: String,
    pub kind: String,
    pub list_kind: String,
}

/// Name of the CRD derived from `table_name` in `group`.
pub fn derived_crd_name(table_name: &str, group: &str) -> String {
    format!("{table_name}s.{group}")
}

pub fn derived_names(table_name: &str, group: &str) -> DerivedNames {
    let kind = title_case(table_name);
    DerivedNames {
        crd_name: derived_crd_name(table_name, group),
        plural: format!("{table_name}s"),
        singular: table_name.to_string(),
        list_kind: format!("{kind}List"),
        kind,
    }
}

/// Upper-cases the first letter of every word.
///
/// A word starts after any character that is not alphanumeric or `_`,
/// so `line-items` becomes `Line-Items` and `line_items` becomes `Line_items`.
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_boundary = true;
    for c in name.chars() {
        if at_boundary {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_boundary = !(c.is_alphanumeric() || c == '_');
    }
    out
}

/// Column name to schema node. Duplicate names keep the last column.
pub fn column_properties(columns: &[ColumnSpec]) -> BTreeMap<String, JSONSchemaProps> {
    columns
        .iter()
        .map(|column| {
            (
                column.name.clone(),
                JSONSchemaProps {
                    type_: Some(column.column_type.clone()),
                    ..Default::default()
                },
            )
        })
        .collect()
}

fn object_schema(properties: BTreeMap<String, JSONSchemaProps>) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("object".to_string()),
        // The API server drops an empty map, keep it absent so stored and
        // desired schemas compare equal.
        properties: (!properties.is_empty()).then_some(properties),
        ..Default::default()
    }
}

/// `{type: object, properties: {spec: {type: object, properties: <columns>}}}`
pub fn validation_schema(columns: &[ColumnSpec]) -> CustomResourceValidation {
    let spec = object_schema(column_properties(columns));
    CustomResourceValidation {
        open_api_v3_schema: Some(object_schema(BTreeMap::from([(
            "spec".to_string(),
            spec,
        )]))),
    }
}

/// One printer column per table column, in declaration order.
pub fn printer_columns(columns: &[ColumnSpec]) -> Vec<CustomResourceColumnDefinition> {
    columns
        .iter()
        .map(|column| CustomResourceColumnDefinition {
            name: column.name.clone(),
            type_: column.column_type.clone(),
            json_path: format!(".spec.{}", column.name),
            ..Default::default()
        })
        .collect()
}

/// Controller reference pointing back at `table`.
pub fn owner_reference(table: &Table) -> Result<OwnerReference, SynthesisError> {
    table
        .controller_owner_ref(&())
        .ok_or_else(|| SynthesisError::OwnerReference {
            table: TableKey::from(table),
        })
}

fn derived_labels(table: &Table) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (
            TABLE_NAMESPACE_LABEL.to_string(),
            table.namespace().unwrap_or_default(),
        ),
        (TABLE_NAME_LABEL.to_string(), table.name_any()),
    ])
}

/// Build the CRD for `table`.
///
/// Fails only when the owner reference cannot be built; a CRD is never
/// returned without one.
pub fn synthesize(
    table: &Table,
    config: &SynthesisConfig,
) -> Result<CustomResourceDefinition, SynthesisError> {
    let owner = owner_reference(table)?;
    let group = config.group_for(table);
    let names = derived_names(&table.name_any(), group);
    let columns = &table.spec.columns;

    Ok(CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(names.crd_name),
            labels: Some(derived_labels(table)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: group.to_string(),
            names: CustomResourceDefinitionNames {
                plural: names.plural,
                singular: Some(names.singular),
                kind: names.kind,
                list_kind: Some(names.list_kind),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: DERIVED_VERSION.to_string(),
                served: true,
                storage: true,
                schema: Some(validation_schema(columns)),
                additional_printer_columns: Some(printer_columns(columns)),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    })
}

/// Whether `observed` already carries every field synthesis controls.
///
/// Fields the API server defaults (conversion, preserveUnknownFields) are
/// ignored.
pub fn matches_desired(observed: &CustomResourceDefinition, desired: &CustomResourceDefinition) -> bool {
    let (o, d) = (&observed.spec, &desired.spec);
    o.group == d.group
        && o.scope == d.scope
        && o.names.plural == d.names.plural
        && o.names.singular == d.names.singular
        && o.names.kind == d.names.kind
        && o.names.list_kind == d.names.list_kind
        && o.versions.len() == d.versions.len()
        && o.versions.iter().zip(&d.versions).all(|(ov, dv)| {
            ov.name == dv.name
                && ov.served == dv.served
                && ov.storage == dv.storage
                && ov.schema == dv.schema
                && ov.additional_printer_columns.as_deref().unwrap_or_default()
                    == dv.additional_printer_columns.as_deref().unwrap_or_default()
        })
}
