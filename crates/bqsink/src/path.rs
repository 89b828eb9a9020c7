//! Dotted field paths (`request.headers.host`)

use crate::error::{Result, SinkError};
use serde_json::{Map, Value};

/// A pre-split dotted path into nested JSON objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(dotted: &str) -> Result<Self> {
        let segments: Vec<String> = dotted.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(SinkError::config(format!("invalid field path: '{}'", dotted)));
        }
        Ok(Self { segments })
    }

    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }

    /// Follow the path; `None` as soon as a segment is missing or a
    /// non-object is crossed.
    pub fn get<'a>(&self, record: &'a Map<String, Value>) -> Option<&'a Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut node = record;
        for segment in parents {
            node = node.get(segment)?.as_object()?;
        }
        node.get(last)
    }

    /// Store `value` at the path, creating missing intermediate objects.
    ///
    /// Crossing an existing non-object value is an error; nothing is
    /// overwritten in that case.
    pub fn set(&self, record: &mut Map<String, Value>, value: Value) -> Result<()> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Ok(());
        };

        let mut node = record;
        for segment in parents {
            let entry = node
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            node = match entry {
                Value::Object(map) => map,
                other => {
                    return Err(SinkError::format(format!(
                        "cannot set {}: '{}' holds {} instead of an object",
                        self.dotted(),
                        segment,
                        other
                    )))
                },
            };
        }
        node.insert(last.clone(), value);
        Ok(())
    }
}
