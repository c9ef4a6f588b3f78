//! Source to target table mappings and their validation against live schemas.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::event::{Row, TableRef};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    #[default]
    SourceWins,
    TargetWins,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub source: String,
    pub target: String,
}

impl ColumnMap {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Mapping of one source table onto one target table.
///
/// Target names default to the source names; an empty column list maps
/// every source column onto a target column of the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_schema: String,
    pub source_table: String,
    #[serde(default)]
    pub target_schema: Option<String>,
    #[serde(default)]
    pub target_table: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnMap>,
    #[serde(default = "default_true")]
    pub capture_enabled: bool,
    #[serde(default = "default_true")]
    pub apply_enabled: bool,
    #[serde(default)]
    pub initial_snapshot: bool,
    #[serde(default)]
    pub conflict_resolution: Option<ConflictResolution>,
}

impl TableMapping {
    pub fn new(source: TableRef, target: TableRef) -> Self {
        Self {
            source_schema: source.schema,
            source_table: source.table,
            target_schema: Some(target.schema),
            target_table: Some(target.table),
            columns: Vec::new(),
            capture_enabled: true,
            apply_enabled: true,
            initial_snapshot: false,
            conflict_resolution: None,
        }
    }

    pub fn with_columns(mut self, columns: Vec<ColumnMap>) -> Self {
        self.columns = columns;
        self
    }

    pub fn source(&self) -> TableRef {
        TableRef::new(&self.source_schema, &self.source_table)
    }

    pub fn target(&self) -> TableRef {
        TableRef::new(
            self.target_schema.as_deref().unwrap_or(&self.source_schema),
            self.target_table.as_deref().unwrap_or(&self.source_table),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// Columns and keys of a table as reported by a datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: TableRef,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub unique_keys: Vec<Vec<String>>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The primary key, or else the first unique key, made up only of
    /// `columns`.
    pub fn unique_key_within(&self, columns: &[String]) -> Option<&[String]> {
        let available: HashSet<&str> = columns.iter().map(String::as_str).collect();
        std::iter::once(&self.primary_key)
            .chain(self.unique_keys.iter())
            .filter(|key| !key.is_empty())
            .find(|key| key.iter().all(|c| available.contains(c.as_str())))
            .map(Vec::as_slice)
    }
}

/// Broad type families used for compatibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeFamily {
    Integer,
    Decimal,
    Float,
    Text,
    Boolean,
    Temporal,
    Json,
    Uuid,
    Binary,
    Other,
}

fn type_family(data_type: &str) -> TypeFamily {
    let t = data_type.trim().to_ascii_lowercase();
    let base = t.split('(').next().unwrap_or("").trim();
    match base {
        "smallint" | "integer" | "int" | "int2" | "int4" | "int8" | "bigint" | "serial"
        | "bigserial" | "smallserial" => TypeFamily::Integer,
        "numeric" | "decimal" => TypeFamily::Decimal,
        "real" | "float4" | "float8" | "double precision" | "float" | "double" => {
            TypeFamily::Float
        }
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" | "string"
        | "name" | "citext" => TypeFamily::Text,
        "boolean" | "bool" => TypeFamily::Boolean,
        "json" | "jsonb" => TypeFamily::Json,
        "uuid" => TypeFamily::Uuid,
        "bytea" | "blob" | "binary" | "varbinary" => TypeFamily::Binary,
        other if other.starts_with("timestamp") || other.starts_with("time") || other == "date" => {
            TypeFamily::Temporal
        }
        _ => TypeFamily::Other,
    }
}

/// Whether values of `source` type can be written into `target` type.
pub fn types_compatible(source: &str, target: &str) -> bool {
    use TypeFamily::*;

    let (s, t) = (type_family(source), type_family(target));
    if s == t || t == Text || s == Other || t == Other {
        return true;
    }
    matches!(
        (s, t),
        (Integer, Decimal) | (Integer, Float) | (Decimal, Float) | (Float, Decimal) | (Uuid, Text)
    )
}

/// A mapping checked against both schemas. Immutable once built.
#[derive(Debug, Clone)]
pub struct ValidatedMapping {
    mapping: TableMapping,
    source: TableRef,
    target: TableRef,
    columns: Vec<ColumnMap>,
    source_key: Vec<String>,
    target_key: Vec<String>,
    to_target: HashMap<String, String>,
}

impl ValidatedMapping {
    /// Checks a mapping against the source schema and, when the target
    /// has one, the target schema.
    ///
    /// Fails with `SchemaMismatch` when a column is missing, mapped twice,
    /// has an incompatible type, or when an apply-enabled table has no key
    /// that is unique on the target.
    pub fn validate(
        mapping: &TableMapping,
        source_schema: &TableSchema,
        target_schema: Option<&TableSchema>,
    ) -> Result<Self> {
        let source = mapping.source();
        let target = mapping.target();

        let columns: Vec<ColumnMap> = if mapping.columns.is_empty() {
            source_schema
                .columns
                .iter()
                .map(|c| ColumnMap::new(&c.name, &c.name))
                .collect()
        } else {
            mapping.columns.clone()
        };

        let mut seen_targets = HashSet::new();
        for column in &columns {
            let source_column = source_schema.column(&column.source).ok_or_else(|| {
                Error::schema_mismatch(
                    &source,
                    format!("source column '{}' does not exist", column.source),
                )
            })?;

            if !seen_targets.insert(column.target.as_str()) {
                return Err(Error::schema_mismatch(
                    &target,
                    format!("target column '{}' is mapped more than once", column.target),
                ));
            }

            if let Some(target_schema) = target_schema {
                let target_column = target_schema.column(&column.target).ok_or_else(|| {
                    Error::schema_mismatch(
                        &target,
                        format!("target column '{}' does not exist", column.target),
                    )
                })?;
                if !types_compatible(&source_column.data_type, &target_column.data_type) {
                    return Err(Error::schema_mismatch(
                        &target,
                        format!(
                            "column '{}' ({}) cannot be written to '{}' ({})",
                            column.source,
                            source_column.data_type,
                            column.target,
                            target_column.data_type
                        ),
                    ));
                }
            }
        }

        let to_target: HashMap<String, String> = columns
            .iter()
            .map(|c| (c.source.clone(), c.target.clone()))
            .collect();

        let source_key = source_schema.primary_key.clone();
        let unmapped_key: Vec<&String> = source_key
            .iter()
            .filter(|c| !to_target.contains_key(*c))
            .collect();
        let mut target_key: Vec<String> = source_key
            .iter()
            .filter_map(|c| to_target.get(c).cloned())
            .collect();

        let key_problem = if source_key.is_empty() {
            Some("source table has no primary key".to_string())
        } else if !unmapped_key.is_empty() {
            Some(format!("primary key columns {:?} are not mapped", unmapped_key))
        } else {
            match target_schema.map(|schema| schema.unique_key_within(&target_key)) {
                // Writes are keyed by the constraint the target enforces
                Some(Some(unique)) => {
                    target_key = unique.to_vec();
                    None
                }
                Some(None) => Some(format!(
                    "target columns {:?} are not covered by a unique constraint",
                    target_key
                )),
                None => None,
            }
        };

        if let Some(problem) = key_problem {
            if mapping.apply_enabled {
                return Err(Error::schema_mismatch(
                    &target,
                    format!("{}; duplicate applies cannot be detected", problem),
                ));
            }
            warn!(source = %source, target = %target, "{}", problem);
        }

        Ok(Self {
            mapping: mapping.clone(),
            source,
            target,
            columns,
            source_key,
            target_key,
            to_target,
        })
    }

    pub fn mapping(&self) -> &TableMapping {
        &self.mapping
    }

    pub fn source(&self) -> &TableRef {
        &self.source
    }

    pub fn target(&self) -> &TableRef {
        &self.target
    }

    pub fn columns(&self) -> &[ColumnMap] {
        &self.columns
    }

    pub fn target_key(&self) -> &[String] {
        &self.target_key
    }

    pub fn source_key(&self) -> &[String] {
        &self.source_key
    }

    pub fn conflict_resolution(&self, default: ConflictResolution) -> ConflictResolution {
        self.mapping.conflict_resolution.unwrap_or(default)
    }

    /// Renames mapped columns to their target names and drops the rest.
    pub fn project(&self, row: &Row) -> Row {
        row.iter()
            .filter_map(|(name, value)| {
                self.to_target
                    .get(name)
                    .map(|target| (target.clone(), value.clone()))
            })
            .collect()
    }

    /// Key columns of a target-shaped row. `None` when a key value is missing.
    pub fn key_of(&self, target_row: &Row) -> Option<Row> {
        self.target_key
            .iter()
            .map(|c| target_row.get(c).map(|v| (c.clone(), v.clone())))
            .collect()
    }
}

fn default_true() -> bool {
    true
}
