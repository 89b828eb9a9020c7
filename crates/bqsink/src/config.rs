//! Sink configuration
//!
//! Loaded from a TOML file layered with `BQSINK__<KEY>` environment
//! overrides, then validated once. Every inconsistency found here is fatal
//! at startup.

use crate::error::{Result, SinkError};
use crate::path::FieldPath;
use crate::rewrite::KeyRewriter;
use crate::schema::FieldSchema;
use crate::time::TimeFormatter;
use bqsink_common::types::{FieldDescriptor, FieldType};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Remote API root
pub const DEFAULT_API_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Bound on every remote call
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Rows per host chunk
pub const DEFAULT_CHUNK_RECORDS_LIMIT: usize = 500;

pub const DEFAULT_RETRY_WAIT_SECS: u64 = 1;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Environment prefix for overrides, e.g. `BQSINK__DATASET`
pub const ENV_PREFIX: &str = "BQSINK";

/// How access tokens are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Service account email plus a PEM private key file
    PrivateKey,
    /// Instance metadata server
    ComputeEngine,
    /// Service account JSON key, inline or as a path
    JsonKey,
    /// Static `access_token` if configured, metadata server otherwise
    ApplicationDefault,
}

impl std::str::FromStr for AuthMethod {
    type Err = SinkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "private_key" => Ok(AuthMethod::PrivateKey),
            "compute_engine" => Ok(AuthMethod::ComputeEngine),
            "json_key" => Ok(AuthMethod::JsonKey),
            "application_default" => Ok(AuthMethod::ApplicationDefault),
            other => Err(SinkError::config(format!(
                "unrecognized 'auth_method': {}",
                other
            ))),
        }
    }
}

fn default_auth_method() -> String {
    "private_key".to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_method() -> String {
    "insert".to_string()
}

fn default_chunk_records_limit() -> usize {
    DEFAULT_CHUNK_RECORDS_LIMIT
}

fn default_retry_wait_secs() -> u64 {
    DEFAULT_RETRY_WAIT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    // ------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub json_key: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Overrides the token endpoint of service-account flows
    #[serde(default)]
    pub token_uri: Option<String>,
    /// Overrides the metadata server token URL
    #[serde(default)]
    pub metadata_token_url: Option<String>,

    // ------------------------------------------------------------------
    // Destination
    // ------------------------------------------------------------------
    pub project: String,
    pub dataset: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    #[serde(default)]
    pub auto_create_table: bool,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_method")]
    pub method: String,

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------
    #[serde(default)]
    pub schema_path: Option<PathBuf>,
    #[serde(default)]
    pub fetch_schema: bool,
    #[serde(default)]
    pub field_string: Vec<String>,
    #[serde(default)]
    pub field_integer: Vec<String>,
    #[serde(default)]
    pub field_float: Vec<String>,
    #[serde(default)]
    pub field_boolean: Vec<String>,
    #[serde(default)]
    pub field_timestamp: Vec<String>,

    // ------------------------------------------------------------------
    // Record keys
    // ------------------------------------------------------------------
    #[serde(default)]
    pub replace_record_key: bool,
    /// `"<pattern> <replacement>"` entries, applied in order
    #[serde(default)]
    pub replace_record_key_regexp: Vec<String>,

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub localtime: Option<bool>,
    #[serde(default)]
    pub utc: Option<bool>,
    #[serde(default)]
    pub time_field: Option<String>,
    #[serde(default)]
    pub time_format_field: Option<String>,

    #[serde(default)]
    pub insert_id_field: Option<String>,

    // ------------------------------------------------------------------
    // Host loop
    // ------------------------------------------------------------------
    #[serde(default = "default_chunk_records_limit")]
    pub buffer_chunk_records_limit: usize,
    #[serde(default = "default_retry_wait_secs")]
    pub retry_wait_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl SinkConfig {
    /// Load a TOML file, overlay `BQSINK__*` variables, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in [
            "tables",
            "field_string",
            "field_integer",
            "field_float",
            "field_boolean",
            "field_timestamp",
        ] {
            environment = environment.with_list_parse_key(key);
        }

        let config: SinkConfig = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Toml))
            .add_source(environment)
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| SinkError::config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text directly, without environment overlay
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: SinkConfig = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| SinkError::config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no I/O
    pub fn validate(&self) -> Result<()> {
        match self.auth_method()? {
            AuthMethod::PrivateKey => {
                if self.email.is_none() || self.private_key_path.is_none() {
                    return Err(SinkError::config(
                        "'email' and 'private_key_path' must be specified if auth_method == 'private_key'",
                    ));
                }
            },
            AuthMethod::JsonKey => {
                if self.json_key.is_none() {
                    return Err(SinkError::config(
                        "'json_key' must be specified if auth_method == 'json_key'",
                    ));
                }
            },
            AuthMethod::ComputeEngine | AuthMethod::ApplicationDefault => {},
        }

        if self.table.is_some() == self.tables.is_some() {
            return Err(SinkError::config(
                "exactly one of 'table' or 'tables' must be specified",
            ));
        }

        if self.project.trim().is_empty() || self.dataset.trim().is_empty() {
            return Err(SinkError::config("'project' and 'dataset' must not be empty"));
        }

        match self.method.as_str() {
            "insert" => {},
            "load" => {
                return Err(SinkError::config("method 'load' is not implemented"));
            },
            other => {
                return Err(SinkError::config(format!("unrecognized 'method': {}", other)));
            },
        }

        if self.localtime == Some(true) && self.utc == Some(true) {
            return Err(SinkError::config("'localtime' and 'utc' cannot both be enabled"));
        }

        if self.request_timeout_secs == 0 {
            return Err(SinkError::config("'request_timeout_secs' must be greater than 0"));
        }

        if self.buffer_chunk_records_limit == 0 {
            return Err(SinkError::config(
                "'buffer_chunk_records_limit' must be greater than 0",
            ));
        }

        // rules are checked even when rewriting is off
        KeyRewriter::from_config(&self.replace_record_key_regexp)?;
        self.time_formatter()?;
        for path in [&self.time_field, &self.time_format_field, &self.insert_id_field]
            .into_iter()
            .flatten()
        {
            FieldPath::parse(path)?;
        }

        Ok(())
    }

    pub fn auth_method(&self) -> Result<AuthMethod> {
        self.auth_method.parse()
    }

    /// Destination templates in configured order
    pub fn table_templates(&self) -> Vec<String> {
        match (&self.table, &self.tables) {
            (Some(table), _) => vec![table.clone()],
            (None, Some(tables)) => tables.iter().map(|t| t.trim().to_string()).collect(),
            (None, None) => Vec::new(),
        }
    }

    pub fn time_formatter(&self) -> Result<TimeFormatter> {
        TimeFormatter::new(self.time_format.clone(), self.localtime.unwrap_or(false))
    }

    pub fn key_rewriter(&self) -> Result<Option<KeyRewriter>> {
        if !self.replace_record_key {
            return Ok(None);
        }
        KeyRewriter::from_config(&self.replace_record_key_regexp).map(Some)
    }

    /// Build the local schema: schema file first, then the `field_<type>`
    /// lists, then the injected time field if nothing declared it.
    pub fn build_schema(&self) -> Result<FieldSchema> {
        let mut schema = FieldSchema::root();

        if let Some(path) = &self.schema_path {
            let text = std::fs::read_to_string(path).map_err(|e| {
                SinkError::config(format!("failed to read schema {}: {}", path.display(), e))
            })?;
            let descriptors: Vec<FieldDescriptor> = serde_json::from_str(&text).map_err(|e| {
                SinkError::config(format!("invalid schema {}: {}", path.display(), e))
            })?;
            schema.load_schema(&descriptors, true)?;
        }

        for field_type in FieldType::LEAVES {
            for name in self.fields_of(field_type) {
                schema.register_field(name.trim(), field_type)?;
            }
        }

        if let Some(time_field) = &self.time_field {
            if schema.field_at(time_field).is_none() {
                schema.register_field(time_field, FieldType::Timestamp)?;
            }
        }

        Ok(schema)
    }

    fn fields_of(&self, field_type: FieldType) -> &[String] {
        match field_type {
            FieldType::String => &self.field_string,
            FieldType::Integer => &self.field_integer,
            FieldType::Float => &self.field_float,
            FieldType::Boolean => &self.field_boolean,
            FieldType::Timestamp => &self.field_timestamp,
            FieldType::Record => &[],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASE: &str = r#"
auth_method = "compute_engine"
project = "proj"
dataset = "logs"
table = "access"
"#;

    fn parse(extra: &str) -> Result<SinkConfig> {
        SinkConfig::from_toml(&format!("{}\n{}", BASE, extra))
    }

    fn parse_replacing(from: &str, to: &str) -> Result<SinkConfig> {
        SinkConfig::from_toml(&BASE.replace(from, to))
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.auth_method().unwrap(), AuthMethod::ComputeEngine);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(config.buffer_chunk_records_limit, DEFAULT_CHUNK_RECORDS_LIMIT);
        assert_eq!(config.table_templates(), vec!["access"]);
        assert!(!config.auto_create_table);
    }

    #[test]
    fn test_auth_requirements() {
        let private_key = parse_replacing("compute_engine", "private_key");
        assert!(matches!(private_key, Err(SinkError::Config(_))));

        let with_key = parse_replacing("auth_method = \"compute_engine\"", "auth_method = \"private_key\"\nemail = \"sa@proj.iam\"\nprivate_key_path = \"/keys/sa.pem\"");
        assert!(with_key.is_ok());

        assert!(parse_replacing("compute_engine", "json_key").is_err());
        assert!(parse_replacing("compute_engine", "application_default").is_ok());
        assert!(parse_replacing("compute_engine", "oauth").is_err());
    }

    #[test]
    fn test_default_auth_method_is_private_key() {
        let result = SinkConfig::from_toml("project = \"p\"\ndataset = \"d\"\ntable = \"t\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_table_and_tables_are_exclusive() {
        assert!(parse("tables = [\"a\", \"b\"]").is_err());
        assert!(parse_replacing("table = \"access\"", "").is_err());

        let config = parse_replacing("table = \"access\"", "tables = [\"a\", \" b\"]").unwrap();
        assert_eq!(config.table_templates(), vec!["a", "b"]);
    }

    #[test]
    fn test_load_method_rejected() {
        assert!(parse("method = \"load\"").is_err());
        assert!(parse("method = \"stream\"").is_err());
    }

    #[test]
    fn test_rewrite_rules_validated() {
        assert!(parse("replace_record_key_regexp = [\"foo\"]").is_err());
        assert!(parse("replace_record_key_regexp = [\"a b\", \"a c\"]").is_err());

        let config = parse("replace_record_key = true\nreplace_record_key_regexp = [\"- _\"]").unwrap();
        let rewriter = config.key_rewriter().unwrap().unwrap();
        assert_eq!(rewriter.rewrite_key("a-b"), "a_b");

        let disabled = parse("replace_record_key_regexp = [\"- _\"]").unwrap();
        assert!(disabled.key_rewriter().unwrap().is_none());
    }

    #[test]
    fn test_conflicting_time_zone_flags() {
        assert!(parse("localtime = true\nutc = true").is_err());
        assert!(parse("utc = true").is_ok());
    }

    #[test]
    fn test_build_schema_from_file_and_lists() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name": "status", "type": "INTEGER", "mode": "REQUIRED"}},
               {{"name": "request", "type": "RECORD", "fields": [{{"name": "path", "type": "STRING"}}]}}]"#
        )
        .unwrap();

        let config = parse(&format!(
            "schema_path = \"{}\"\nfield_string = [\"request.method\"]\nfield_float = [\"latency\"]\ntime_field = \"time\"",
            file.path().display()
        ))
        .unwrap();

        let schema = config.build_schema().unwrap();
        assert_eq!(schema.field("status").unwrap().field_type(), FieldType::Integer);
        assert_eq!(schema.field_at("request.path").unwrap().field_type(), FieldType::String);
        assert_eq!(schema.field_at("request.method").unwrap().field_type(), FieldType::String);
        assert_eq!(schema.field("latency").unwrap().field_type(), FieldType::Float);
        assert_eq!(schema.field("time").unwrap().field_type(), FieldType::Timestamp);
    }

    #[test]
    fn test_build_schema_conflicting_lists() {
        let config = parse("field_string = [\"a\"]\nfield_integer = [\"a\"]").unwrap();
        assert!(matches!(config.build_schema(), Err(SinkError::Config(_))));

        let config = parse("field_string = [\"9lives\"]").unwrap();
        assert!(config.build_schema().is_err());
    }

    #[test]
    fn test_declared_time_field_keeps_its_type() {
        let config = parse("field_string = [\"time\"]\ntime_field = \"time\"").unwrap();
        let schema = config.build_schema().unwrap();
        assert_eq!(schema.field("time").unwrap().field_type(), FieldType::String);
    }
}
