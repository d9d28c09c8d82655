//! Field-level validation error collection.
//!
//! Validation rejects bad input before anything is persisted; every violation
//! is reported, never silently dropped.

use std::collections::HashMap;

use thiserror::Error;

/// Validation errors collected across fields.
#[derive(Error, Debug, Default, Clone)]
#[error("validation failed: {:?}", self.full_messages())]
pub struct ValidationErrors {
    /// Field-specific errors: field name -> messages.
    pub errors: HashMap<String, Vec<String>>,
    /// Errors not tied to a specific field.
    pub base_errors: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn add_base(&mut self, message: impl Into<String>) {
        self.base_errors.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.base_errors.is_empty()
    }

    pub fn has_error(&self, field: &str) -> bool {
        self.errors.contains_key(field)
    }

    /// Convert into a `Result`, erroring if anything was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn full_messages(&self) -> Vec<String> {
        let mut messages = self.base_errors.clone();
        for (field, field_messages) in &self.errors {
            for msg in field_messages {
                messages.push(format!("{} {}", field, msg));
            }
        }
        messages
    }
}
