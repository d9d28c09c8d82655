//! Notification templates and rendering.
//!
//! A template carries a generic title/content pair plus optional dedicated
//! fields per channel. Rendering substitutes `{{key}}` tokens from a typed
//! variable map and resolves `{{#if key}}` / `{{#unless key}}` blocks.
//! Rendering failures are non-fatal to delivery; the engine falls back to
//! the notification's raw title and message.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_core::error::ValidationErrors;
use courier_core::types::MetaMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::channels::RenderedContent;
use crate::notification::{Channel, NotificationCategory, NotificationType};
use crate::store::NotificationStore;

/// Template errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(Uuid),
    #[error("storage error: {0}")]
    Storage(String),
}

pub type TemplateResult<T> = Result<T, TemplateError>;

/// A notification template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    /// Stable lookup key, unique per template family.
    pub key: String,
    pub notification_type: NotificationType,
    pub category: NotificationCategory,
    /// Generic title, used when no channel-specific field applies.
    pub title: String,
    /// Generic content, used when no channel-specific field applies.
    pub content: String,
    pub email_subject: Option<String>,
    pub email_html: Option<String>,
    pub email_text: Option<String>,
    pub sms_text: Option<String>,
    pub push_title: Option<String>,
    pub push_body: Option<String>,
    pub in_app_title: Option<String>,
    pub in_app_message: Option<String>,
    /// Variable names the template declares.
    pub variables: Vec<String>,
    /// Sample data for previewing.
    pub sample_data: Option<MetaMap>,
    pub public: bool,
    pub approved: bool,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn new(
        key: impl Into<String>,
        notification_type: NotificationType,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            notification_type,
            category: notification_type.category(),
            title: title.into(),
            content: content.into(),
            email_subject: None,
            email_html: None,
            email_text: None,
            sms_text: None,
            push_title: None,
            push_body: None,
            in_app_title: None,
            in_app_message: None,
            variables: Vec::new(),
            sample_data: None,
            public: false,
            approved: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pick the title/content pair for a channel, preferring dedicated
    /// fields and falling back to the generic pair.
    fn content_for(&self, channel: Option<Channel>) -> (String, String) {
        let title = self.title.clone();
        let content = self.content.clone();
        match channel {
            None => (title, content),
            Some(Channel::Email) => (
                self.email_subject.clone().unwrap_or(title),
                self.email_html
                    .clone()
                    .or_else(|| self.email_text.clone())
                    .unwrap_or(content),
            ),
            Some(Channel::Sms) => (title, self.sms_text.clone().unwrap_or(content)),
            Some(Channel::Push) => (
                self.push_title.clone().unwrap_or(title),
                self.push_body.clone().unwrap_or(content),
            ),
            Some(Channel::InApp) => (
                self.in_app_title.clone().unwrap_or(title),
                self.in_app_message.clone().unwrap_or(content),
            ),
        }
    }
}

/// Unvalidated template input from a CRUD surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub key: String,
    pub notification_type: String,
    pub category: String,
    pub title: String,
    pub content: String,
    pub email_subject: Option<String>,
    pub email_html: Option<String>,
    pub email_text: Option<String>,
    pub sms_text: Option<String>,
    pub push_title: Option<String>,
    pub push_body: Option<String>,
    pub in_app_title: Option<String>,
    pub in_app_message: Option<String>,
}

/// Resolves templates into channel-specific content.
pub struct TemplateRenderer {
    store: Arc<dyn NotificationStore>,
}

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("static regex"));
static IF_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\{#if\s+([A-Za-z0-9_.]+)\s*\}\}(.*?)\{\{/if\}\}").expect("static regex")
});
static UNLESS_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\{#unless\s+([A-Za-z0-9_.]+)\s*\}\}(.*?)\{\{/unless\}\}")
        .expect("static regex")
});
static STRAY_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{[#/][^{}]*\}\}").expect("static regex"));
static TOKEN_INTERIOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w\s#/.@-]+$").expect("static regex"));

impl TemplateRenderer {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Render a template with the given variables. Without a channel the
    /// generic title/content pair is returned; with one, the channel's
    /// dedicated fields are preferred.
    pub async fn render(
        &self,
        template_id: Uuid,
        variables: &MetaMap,
        channel: Option<Channel>,
    ) -> TemplateResult<RenderedContent> {
        let template = self
            .store
            .get_template(template_id)
            .await
            .map_err(|e| TemplateError::Storage(e.to_string()))?
            .ok_or(TemplateError::NotFound(template_id))?;

        let (title, content) = template.content_for(channel);
        Ok(RenderedContent::new(
            apply_variables(&title, variables),
            apply_variables(&content, variables),
        ))
    }
}

/// Substitute `{{key}}` tokens, then resolve `{{#if}}` / `{{#unless}}`
/// blocks. Undefined variables render as empty strings; unmatched block
/// markers render as empty rather than erroring.
pub fn apply_variables(text: &str, variables: &MetaMap) -> String {
    let mut out = TOKEN_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            variables
                .get(&caps[1])
                .map(|v| v.display_string())
                .unwrap_or_default()
        })
        .into_owned();

    // Sequential blocks resolve in one pass each; repeat until stable so
    // simple nesting collapses too.
    loop {
        let pass = IF_BLOCK_RE
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                if variables.get(&caps[1]).is_some_and(|v| v.is_truthy()) {
                    caps[2].to_string()
                } else {
                    String::new()
                }
            })
            .into_owned();
        let pass = UNLESS_BLOCK_RE
            .replace_all(&pass, |caps: &regex::Captures<'_>| {
                if variables.get(&caps[1]).is_some_and(|v| v.is_truthy()) {
                    String::new()
                } else {
                    caps[2].to_string()
                }
            })
            .into_owned();
        if pass == out {
            break;
        }
        out = pass;
    }

    STRAY_BLOCK_RE.replace_all(&out, "").into_owned()
}

/// Validate a template draft: required fields, closed enumerations, and
/// well-formed `{{...}}` tokens in every textual field.
pub fn validate_template(draft: &TemplateDraft) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    if draft.key.trim().is_empty() {
        errors.add("key", "must not be empty");
    }
    if draft.title.trim().is_empty() {
        errors.add("title", "must not be empty");
    }
    if draft.content.trim().is_empty() {
        errors.add("content", "must not be empty");
    }
    if NotificationType::parse(&draft.notification_type).is_none() {
        errors.add(
            "notification_type",
            format!("'{}' is not a known notification type", draft.notification_type),
        );
    }
    if NotificationCategory::parse(&draft.category).is_none() {
        errors.add(
            "category",
            format!("'{}' is not a known category", draft.category),
        );
    }

    let textual_fields: [(&str, Option<&str>); 10] = [
        ("title", Some(draft.title.as_str())),
        ("content", Some(draft.content.as_str())),
        ("email_subject", draft.email_subject.as_deref()),
        ("email_html", draft.email_html.as_deref()),
        ("email_text", draft.email_text.as_deref()),
        ("sms_text", draft.sms_text.as_deref()),
        ("push_title", draft.push_title.as_deref()),
        ("push_body", draft.push_body.as_deref()),
        ("in_app_title", draft.in_app_title.as_deref()),
        ("in_app_message", draft.in_app_message.as_deref()),
    ];
    for (field, value) in textual_fields {
        if let Some(text) = value {
            scan_tokens(field, text, &mut errors);
        }
    }

    errors.into_result()
}

/// Report every malformed `{{...}}` occurrence in a field. A token is valid
/// only if its interior matches `[\w\s#/.@-]+`.
fn scan_tokens(field: &str, text: &str, errors: &mut ValidationErrors) {
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let interior = &after[..close];
                if !TOKEN_INTERIOR_RE.is_match(interior) {
                    errors.add(
                        field,
                        format!("contains malformed template token '{{{{{}}}}}'", interior),
                    );
                }
                rest = &after[close + 2..];
            }
            None => {
                errors.add(field, "contains unterminated template token");
                break;
            }
        }
    }
}
