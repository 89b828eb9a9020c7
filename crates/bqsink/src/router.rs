//! Round-robin destination rotation
//!
//! Each call reads the template under the cursor and advances the cursor
//! while holding one lock, so concurrent callers each consume exactly one
//! rotation step.

use crate::error::{Result, SinkError};
use crate::time::validate_strftime;
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct TableRouter {
    templates: Vec<String>,
    cursor: Mutex<usize>,
}

impl TableRouter {
    /// Build from destination templates in rotation order.
    ///
    /// Templates may contain strftime directives; invalid ones are rejected
    /// here rather than at expansion time.
    pub fn new(templates: Vec<String>) -> Result<Self> {
        if templates.is_empty() {
            return Err(SinkError::config("at least one destination table is required"));
        }
        for template in &templates {
            if template.trim().is_empty() {
                return Err(SinkError::config("destination table template is empty"));
            }
            validate_strftime(template)?;
        }

        Ok(Self {
            templates,
            cursor: Mutex::new(0),
        })
    }

    /// Next template in rotation, wrapping around
    pub fn next(&self) -> String {
        // a poisoned cursor is still a valid index
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let template = self.templates[*cursor].clone();
        *cursor = (*cursor + 1) % self.templates.len();
        template
    }

    /// First configured template, independent of rotation
    pub fn first(&self) -> &str {
        &self.templates[0]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn router(templates: &[&str]) -> TableRouter {
        TableRouter::new(templates.iter().map(|t| t.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_sequential_rotation_wraps() {
        let router = router(&["t1", "t2", "t3"]);
        let seen: Vec<String> = (0..4).map(|_| router.next()).collect();
        assert_eq!(seen, vec!["t1", "t2", "t3", "t1"]);
        assert_eq!(router.first(), "t1");
    }

    #[test]
    fn test_single_template_always_returned() {
        let router = router(&["access_%Y%m%d"]);
        assert_eq!(router.next(), "access_%Y%m%d");
        assert_eq!(router.next(), "access_%Y%m%d");
    }

    #[test]
    fn test_concurrent_callers_see_each_template_once_per_rotation() {
        const THREADS: usize = 8;
        const CALLS: usize = 300;

        let router = Arc::new(router(&["t1", "t2", "t3"]));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let router = Arc::clone(&router);
                std::thread::spawn(move || (0..CALLS).map(|_| router.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for template in handle.join().unwrap() {
                *counts.entry(template).or_default() += 1;
            }
        }

        let total = THREADS * CALLS;
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, total / 3);
        }
        // all calls consumed: the cursor is back at the start
        assert_eq!(router.next(), "t1");
    }

    #[test]
    fn test_invalid_templates_rejected() {
        assert!(TableRouter::new(Vec::new()).is_err());
        assert!(TableRouter::new(vec!["".to_string()]).is_err());
        assert!(TableRouter::new(vec!["t_%Q".to_string()]).is_err());
    }
}
