//! bqsink Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared wire types, utilities, and error handling for the bqsink workspace.
//!
//! # Overview
//!
//! - **Types**: the JSON shapes exchanged with the remote tabular store
//!   (schema descriptors, table resources, insert requests, error bodies)
//! - **Logging**: centralized `tracing` subscriber setup
//! - **Error Handling**: error and result types for wire parsing
//!
//! # Example
//!
//! ```no_run
//! use bqsink_common::types::{FieldDescriptor, FieldMode, FieldType};
//!
//! let field = FieldDescriptor::leaf("user_id", FieldType::Integer, FieldMode::Required);
//! println!("{}", serde_json::to_string(&field).unwrap());
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
