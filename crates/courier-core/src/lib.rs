//! # courier-core
//!
//! Foundational types shared by the Courier notification delivery engine:
//! the typed open value map used for metadata and template variables,
//! field-level validation error collection, and engine configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::ValidationErrors;
pub use types::{MetaMap, MetaValue};
