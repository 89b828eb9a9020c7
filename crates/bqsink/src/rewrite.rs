//! Record key normalization
//!
//! Keys are rewritten by applying every configured `(pattern, replacement)`
//! rule in order, then stripping any character outside `[A-Za-z0-9_]`.
//! Only top-level keys are touched. Two keys that rewrite to the same name
//! collide, and the one visited last wins.

use crate::error::{Result, SinkError};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Maximum number of rewrite rules accepted from configuration
pub const MAX_RULES: usize = 10;

#[allow(clippy::expect_used)]
static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("non-word pattern"));

#[derive(Debug, Clone)]
struct Rule {
    pattern: Regex,
    replacement: String,
}

/// Ordered list of key rewrite rules
#[derive(Debug, Clone, Default)]
pub struct KeyRewriter {
    rules: Vec<Rule>,
}

impl KeyRewriter {
    /// Build from `(pattern, replacement)` pairs in configuration order.
    ///
    /// Replacements use `regex` syntax (`$1`, `${name}`).
    pub fn new<I, P, R>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, R)>,
        P: AsRef<str>,
        R: Into<String>,
    {
        let mut compiled: Vec<Rule> = Vec::new();

        for (pattern, replacement) in rules {
            let pattern = pattern.as_ref();
            if compiled.iter().any(|r| r.pattern.as_str() == pattern) {
                return Err(SinkError::config(format!(
                    "replace_record_key_regexp contains a duplicated key, {}",
                    pattern
                )));
            }
            let regex = Regex::new(pattern).map_err(|e| {
                SinkError::config(format!("invalid key rewrite pattern '{}': {}", pattern, e))
            })?;
            compiled.push(Rule {
                pattern: regex,
                replacement: replacement.into(),
            });
        }

        Ok(Self { rules: compiled })
    }

    /// Parse rules written as `"<pattern> <replacement>"`, split on the first
    /// space.
    pub fn from_config(entries: &[String]) -> Result<Self> {
        if entries.len() > MAX_RULES {
            return Err(SinkError::config(format!(
                "at most {} replace_record_key_regexp rules are supported, got {}",
                MAX_RULES,
                entries.len()
            )));
        }

        let mut pairs = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let (pattern, replacement) = entry.split_once(' ').ok_or_else(|| {
                SinkError::config(format!(
                    "replace_record_key_regexp{} does not contain 2 parameters",
                    i + 1
                ))
            })?;
            pairs.push((pattern, replacement));
        }

        Self::new(pairs)
    }

    pub fn rewrite_key(&self, key: &str) -> String {
        let rewritten = self.rules.iter().fold(key.to_string(), |key, rule| {
            rule.pattern
                .replace_all(&key, rule.replacement.as_str())
                .into_owned()
        });
        NON_WORD.replace_all(&rewritten, "").into_owned()
    }

    /// Rewrite every top-level key of `record`
    pub fn rewrite(&self, record: Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::with_capacity(record.len());
        for (key, value) in record {
            out.insert(self.rewrite_key(&key), value);
        }
        out
    }
}
