//! Recursive schema tree
//!
//! A [`FieldSchema`] is either a leaf column or a record owning an ordered
//! list of child schemas. The root of every tree is an unnamed-in-practice
//! record called `record`, so the same node type serves as both "nested
//! record column" and "whole table schema".
//!
//! Trees are built once from configuration (schema file, `field_<type>`
//! lists, optional remote fetch) and are only read afterwards.

use crate::error::{Result, SinkError};
use bqsink_common::types::{FieldDescriptor, FieldMode, FieldType};
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::sync::LazyLock;

/// Column names: letters, digits and underscores, not starting with a digit,
/// at most 128 characters.
#[allow(clippy::expect_used)]
static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("field name pattern"));

/// Numeric prefix accepted by lenient float coercion ("1.5kg" -> 1.5)
#[allow(clippy::expect_used)]
static FLOAT_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:\d+(?:\.\d+)?|\.\d+)(?:[eE][+-]?\d+)?").expect("float prefix pattern")
});

/// Name of the root record of every tree
pub const ROOT_NAME: &str = "record";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Record(Vec<FieldSchema>),
}

impl FieldKind {
    fn empty(field_type: FieldType) -> Self {
        match field_type {
            FieldType::String => FieldKind::String,
            FieldType::Integer => FieldKind::Integer,
            FieldType::Float => FieldKind::Float,
            FieldType::Boolean => FieldKind::Boolean,
            FieldType::Timestamp => FieldKind::Timestamp,
            FieldType::Record => FieldKind::Record(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    name: String,
    mode: FieldMode,
    kind: FieldKind,
}

/// Returns true when `name` is a legal column name
pub fn is_valid_field_name(name: &str) -> bool {
    FIELD_NAME.is_match(name)
}

impl FieldSchema {
    /// Build an empty node. Fails on an illegal name.
    pub fn new(name: impl Into<String>, field_type: FieldType, mode: FieldMode) -> Result<Self> {
        let name = name.into();
        if !is_valid_field_name(&name) {
            return Err(SinkError::config(format!("invalid field name: '{}'", name)));
        }

        Ok(Self {
            name,
            mode,
            kind: FieldKind::empty(field_type),
        })
    }

    /// Empty root record
    pub fn root() -> Self {
        Self {
            name: ROOT_NAME.to_string(),
            mode: FieldMode::Nullable,
            kind: FieldKind::Record(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> FieldMode {
        self.mode
    }

    pub fn field_type(&self) -> FieldType {
        match self.kind {
            FieldKind::String => FieldType::String,
            FieldKind::Integer => FieldType::Integer,
            FieldKind::Float => FieldType::Float,
            FieldKind::Boolean => FieldType::Boolean,
            FieldKind::Timestamp => FieldType::Timestamp,
            FieldKind::Record(_) => FieldType::Record,
        }
    }

    /// Children of a record, empty for leaves
    pub fn fields(&self) -> &[FieldSchema] {
        match &self.kind {
            FieldKind::Record(fields) => fields,
            _ => &[],
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// Look up a dotted path such as `request.headers.host`
    pub fn field_at(&self, path: &str) -> Option<&FieldSchema> {
        path.split('.').try_fold(self, |node, segment| node.field(segment))
    }

    fn fields_mut(&mut self) -> Result<&mut Vec<FieldSchema>> {
        match &mut self.kind {
            FieldKind::Record(fields) => Ok(fields),
            _ => Err(SinkError::config(format!(
                "field {} is not a record",
                self.name
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Formatting
    // ------------------------------------------------------------------------

    /// Coerce one value according to this field's mode.
    ///
    /// `Ok(None)` means the key must be omitted from the output.
    pub fn format(&self, value: Option<&Value>) -> Result<Option<Value>> {
        let value = value.filter(|v| !v.is_null());

        match self.mode {
            FieldMode::Nullable => value.map(|v| self.format_one(v)).transpose(),
            FieldMode::Required => match value {
                Some(v) => self.format_one(v).map(Some),
                None => Err(SinkError::format(format!(
                    "Required field {} cannot be null",
                    self.name
                ))),
            },
            FieldMode::Repeated => match value {
                None => Ok(Some(Value::Array(Vec::new()))),
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| self.format_one(item))
                    .collect::<Result<Vec<_>>>()
                    .map(|items| Some(Value::Array(items))),
                Some(other) => Err(SinkError::format(format!(
                    "Repeated field {} expects an array, got {}",
                    self.name,
                    json_kind(other)
                ))),
            },
        }
    }

    /// Coerce a whole record against this node's children, omitting absent
    /// nullable fields.
    pub fn format_record(&self, record: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for field in self.fields() {
            if let Some(formatted) = field.format(record.get(&field.name))? {
                out.insert(field.name.clone(), formatted);
            }
        }
        Ok(out)
    }

    fn format_one(&self, value: &Value) -> Result<Value> {
        match &self.kind {
            FieldKind::String => Ok(Value::String(coerce_string(value))),
            FieldKind::Integer => coerce_integer(value)
                .map(Value::from)
                .ok_or_else(|| self.mismatch("an integer", value)),
            FieldKind::Float => coerce_float(value)
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| self.mismatch("a float", value)),
            FieldKind::Boolean => Ok(Value::Bool(!matches!(value, Value::Null | Value::Bool(false)))),
            FieldKind::Timestamp => Ok(value.clone()),
            FieldKind::Record(_) => match value {
                Value::Object(record) => self.format_record(record).map(Value::Object),
                other => Err(self.mismatch("a record", other)),
            },
        }
    }

    fn mismatch(&self, expected: &str, value: &Value) -> SinkError {
        SinkError::format(format!(
            "Field {} cannot coerce {} into {}",
            self.name,
            json_kind(value),
            expected
        ))
    }

    // ------------------------------------------------------------------------
    // Construction and merge
    // ------------------------------------------------------------------------

    /// Merge flat descriptors into this record.
    ///
    /// With `allow_overwrite == false`, names already present are skipped
    /// entirely, so manually declared fields win over fetched ones. A record
    /// column can never be replaced by a leaf.
    pub fn load_schema(&mut self, descriptors: &[FieldDescriptor], allow_overwrite: bool) -> Result<()> {
        let fields = self.fields_mut()?;

        for descriptor in descriptors {
            let field_type = descriptor
                .field_type()
                .ok_or_else(|| {
                    SinkError::config(format!("field {} must have type", descriptor.name))
                })??;
            let mode = descriptor.mode()?;

            let existing = fields.iter().position(|f| f.name == descriptor.name);
            if existing.is_some() && !allow_overwrite {
                continue;
            }

            if field_type == FieldType::Record {
                let children = descriptor.fields.as_deref().ok_or_else(|| {
                    SinkError::config(format!(
                        "record field {} must have fields",
                        descriptor.name
                    ))
                })?;

                match existing {
                    Some(i) if fields[i].field_type() == FieldType::Record => {
                        fields[i].mode = mode;
                        fields[i].load_schema(children, allow_overwrite)?;
                    },
                    _ => {
                        let mut record = FieldSchema::new(&descriptor.name, FieldType::Record, mode)?;
                        record.load_schema(children, allow_overwrite)?;
                        upsert(fields, existing, record);
                    },
                }
            } else {
                if let Some(i) = existing {
                    if fields[i].field_type() == FieldType::Record {
                        return Err(SinkError::config(format!(
                            "field {} is a record and cannot be overwritten as {}",
                            descriptor.name, field_type
                        )));
                    }
                }
                let leaf = FieldSchema::new(&descriptor.name, field_type, mode)?;
                upsert(fields, existing, leaf);
            }
        }

        Ok(())
    }

    /// Register a nullable leaf at a dotted path, creating intermediate
    /// records as needed.
    ///
    /// Registering an existing leaf again is accepted when the type is the
    /// same, or when either side is `TIMESTAMP` (the later registration
    /// wins). Any other conflict is a configuration error.
    pub fn register_field(&mut self, path: &str, field_type: FieldType) -> Result<()> {
        if field_type == FieldType::Record {
            return Err(SinkError::config(format!(
                "field {} cannot be registered as a record",
                path
            )));
        }

        let segments: Vec<&str> = path.split('.').collect();
        let Some((leaf, parents)) = segments.split_last() else {
            return Err(SinkError::config("empty field path"));
        };

        let mut node = self;
        for segment in parents {
            node = node.child_record(segment)?;
        }
        node.register_leaf(leaf, field_type)
    }

    fn child_record(&mut self, name: &str) -> Result<&mut FieldSchema> {
        let fields = self.fields_mut()?;

        if let Some(i) = fields.iter().position(|f| f.name == name) {
            if fields[i].field_type() != FieldType::Record {
                return Err(SinkError::config(format!(
                    "field {} is required to be a record but already registered as {}",
                    name,
                    fields[i].field_type()
                )));
            }
            return Ok(&mut fields[i]);
        }

        fields.push(FieldSchema::new(name, FieldType::Record, FieldMode::Nullable)?);
        let last = fields.len() - 1;
        Ok(&mut fields[last])
    }

    fn register_leaf(&mut self, name: &str, field_type: FieldType) -> Result<()> {
        let fields = self.fields_mut()?;
        let leaf = FieldSchema::new(name, field_type, FieldMode::Nullable)?;

        match fields.iter().position(|f| f.name == name) {
            None => fields.push(leaf),
            Some(i) => {
                let registered = fields[i].field_type();
                if registered == field_type {
                    return Ok(());
                }
                let tolerated = registered != FieldType::Record
                    && (registered == FieldType::Timestamp || field_type == FieldType::Timestamp);
                if !tolerated {
                    return Err(SinkError::config(format!(
                        "field {} is registered twice ({} and {})",
                        name, registered, field_type
                    )));
                }
                fields[i] = leaf;
            },
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------------

    pub fn to_descriptor(&self) -> FieldDescriptor {
        match &self.kind {
            FieldKind::Record(_) => {
                FieldDescriptor::record(&self.name, self.mode, self.to_descriptors())
            },
            _ => FieldDescriptor::leaf(&self.name, self.field_type(), self.mode),
        }
    }

    /// Descriptors of this node's children; the `schema.fields` of a table
    pub fn to_descriptors(&self) -> Vec<FieldDescriptor> {
        self.fields().iter().map(FieldSchema::to_descriptor).collect()
    }
}

fn upsert(fields: &mut Vec<FieldSchema>, existing: Option<usize>, field: FieldSchema) {
    match existing {
        Some(i) => fields[i] = field,
        None => fields.push(field),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Null | Value::Bool(false) => Some(0),
        Value::Bool(true) => Some(1),
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => leading_integer(s),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Null | Value::Bool(false) => Some(0.0),
        Value::Bool(true) => Some(1.0),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned = s.trim_start().replace('_', "");
            Some(
                FLOAT_PREFIX
                    .find(&cleaned)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0.0),
            )
        },
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Lenient integer parse: optional sign, then digits (single underscores
/// between digits allowed) up to the first other character. No digits
/// yields 0; overflow yields `None`.
fn leading_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut acc: i64 = 0;
    let mut seen_digit = false;
    let mut after_underscore = false;
    for c in digits.chars() {
        match c {
            '0'..='9' => {
                let d = i64::from(c as u8 - b'0');
                acc = acc.checked_mul(10)?;
                acc = if negative { acc.checked_sub(d)? } else { acc.checked_add(d)? };
                seen_digit = true;
                after_underscore = false;
            },
            '_' if seen_digit && !after_underscore => after_underscore = true,
            _ => break,
        }
    }

    Some(acc)
}
