//! Wire types shared with the remote tabular store
//!
//! These mirror the JSON bodies of the table and row endpoints. Field names
//! follow the remote API (camelCase), so every struct carries
//! `#[serde(rename_all = "camelCase")]`.

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Schema Types
// ============================================================================

/// Column type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Record,
}

impl FieldType {
    /// Leaf types, in the order their `field_<type>` config lists are applied
    pub const LEAVES: [FieldType; 5] = [
        FieldType::String,
        FieldType::Integer,
        FieldType::Float,
        FieldType::Boolean,
        FieldType::Timestamp,
    ];

    /// Wire name of the type (`STRING`, `INTEGER`, ...)
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Record => "RECORD",
        }
    }
}

impl std::str::FromStr for FieldType {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // The remote API reports standard-SQL aliases for tables created elsewhere
        match s.to_lowercase().as_str() {
            "string" => Ok(FieldType::String),
            "integer" | "int64" => Ok(FieldType::Integer),
            "float" | "float64" => Ok(FieldType::Float),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            "timestamp" => Ok(FieldType::Timestamp),
            "record" | "struct" => Ok(FieldType::Record),
            _ => Err(CommonError::InvalidFieldType(s.to_string())),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nullability of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    /// The cell can be null
    #[default]
    Nullable,
    /// The cell cannot be null
    Required,
    /// Zero or more values
    Repeated,
}

impl FieldMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Required => "REQUIRED",
            FieldMode::Repeated => "REPEATED",
        }
    }
}

impl std::str::FromStr for FieldMode {
    type Err = CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nullable" => Ok(FieldMode::Nullable),
            "required" => Ok(FieldMode::Required),
            "repeated" => Ok(FieldMode::Repeated),
            _ => Err(CommonError::InvalidFieldMode(s.to_string())),
        }
    }
}

impl std::fmt::Display for FieldMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat, recursive wire representation of one schema node.
///
/// `type` and `mode` are kept as raw strings so that descriptors read from
/// schema files or remote tables can be validated with useful messages;
/// use [`FieldDescriptor::field_type`] and [`FieldDescriptor::mode`] to
/// interpret them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldDescriptor>>,
}

impl FieldDescriptor {
    /// Descriptor for a leaf column
    pub fn leaf(name: impl Into<String>, field_type: FieldType, mode: FieldMode) -> Self {
        Self {
            name: name.into(),
            field_type: Some(field_type.as_str().to_string()),
            mode: Some(mode.as_str().to_string()),
            fields: None,
        }
    }

    /// Descriptor for a nested record column
    pub fn record(name: impl Into<String>, mode: FieldMode, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            field_type: Some(FieldType::Record.as_str().to_string()),
            mode: Some(mode.as_str().to_string()),
            fields: Some(fields),
        }
    }

    /// Parsed type; `None` when the descriptor carries no type at all
    pub fn field_type(&self) -> Option<Result<FieldType>> {
        self.field_type.as_deref().map(str::parse)
    }

    /// Parsed mode, defaulting to `NULLABLE` when absent
    pub fn mode(&self) -> Result<FieldMode> {
        match self.mode.as_deref() {
            Some(mode) => mode.parse(),
            None => Ok(FieldMode::default()),
        }
    }
}

/// `{ fields: [...] }` wrapper used by table resources
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

// ============================================================================
// Table Types
// ============================================================================

/// Fully-qualified table address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,

    pub table_id: String,
}

/// Table resource, used as the body of a create call and as the result of a
/// table lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableResource {
    pub table_reference: TableReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchema>,
}

impl TableResource {
    /// Create-destination body: only the table id and the schema are sent
    pub fn for_create(table_id: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            table_reference: TableReference {
                project_id: None,
                dataset_id: None,
                table_id: table_id.into(),
            },
            schema: Some(TableSchema { fields }),
        }
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// One row of a streaming insert, also the persisted per-row record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertRow {
    pub json: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<String>,
}

/// Body of a streaming insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertAllRequest {
    pub rows: Vec<InsertRow>,
}

/// Successful streaming insert response; row-level errors arrive here
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertAllResponse {
    #[serde(default)]
    pub insert_errors: Vec<Value>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Structured error body returned by the remote API
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<u16>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub status: Option<String>,
}
