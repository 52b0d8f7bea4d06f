//! Strata selection predicates: label + field selectors evaluated against the
//! serialized form of any stored object.

#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::Value as Json;
use strata_core::StorageError;
use tracing::warn;

pub mod fields;
pub mod labels;

pub use fields::{field_value, FieldOp, FieldRequirement, FieldSelector};
pub use labels::{LabelOp, LabelRequirement, LabelSelector};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid selector {input:?}: {reason}")]
pub struct SelectorError {
    pub input: String,
    pub reason: &'static str,
}

impl SelectorError {
    pub(crate) fn new(input: &str, reason: &'static str) -> Self {
        Self { input: input.to_string(), reason }
    }
}

impl From<SelectorError> for StorageError {
    fn from(e: SelectorError) -> Self {
        StorageError::InvalidRequest(e.to_string())
    }
}

/// Label and field selection plus the paging/bookmark knobs that travel with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    pub label: LabelSelector,
    pub field: FieldSelector,
    /// Maximum items per list page; 0 is unlimited.
    pub limit: i64,
    /// Opaque continue token from a previous page.
    pub continue_token: String,
    pub allow_watch_bookmarks: bool,
}

impl Predicate {
    /// The identity predicate.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(label: &str, field: &str) -> Result<Self, SelectorError> {
        Ok(Self { label: LabelSelector::parse(label)?, field: FieldSelector::parse(field)?, ..Self::default() })
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_continue(mut self, token: impl Into<String>) -> Self {
        self.continue_token = token.into();
        self
    }

    pub fn with_bookmarks(mut self, allow: bool) -> Self {
        self.allow_watch_bookmarks = allow;
        self
    }

    /// True when no selector narrows the result.
    pub fn selects_everything(&self) -> bool {
        self.label.is_empty() && self.field.is_empty()
    }

    /// Evaluate against an object already rendered to JSON.
    pub fn matches_value(&self, obj: &Json) -> bool {
        if self.selects_everything() {
            return true;
        }
        let labels = obj.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.as_object());
        let label_ok = self
            .label
            .matches(|k| labels.and_then(|l| l.get(k)).and_then(|v| v.as_str()));
        label_ok && self.field.matches(obj)
    }

    /// Evaluate against a typed object. Objects that fail to serialize never match.
    pub fn matches<T: Serialize>(&self, obj: &T) -> bool {
        if self.selects_everything() {
            return true;
        }
        match serde_json::to_value(obj) {
            Ok(v) => self.matches_value(&v),
            Err(e) => {
                warn!(error = %e, "predicate: object not serializable");
                false
            }
        }
    }
}
