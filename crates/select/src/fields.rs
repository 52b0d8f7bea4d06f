//! Field selectors over the serialized object: `spec.nodeName=bar,metadata.name!=x`.

use std::fmt;

use serde_json::Value as Json;
use smallvec::SmallVec;

use crate::SelectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Equals,
    NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRequirement {
    pub path: String,
    pub op: FieldOp,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: SmallVec<[FieldRequirement; 4]>,
}

impl FieldSelector {
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[FieldRequirement] {
        &self.requirements
    }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let mut requirements = SmallVec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (path, op, value) = if let Some((k, v)) = part.split_once("!=") {
                (k, FieldOp::NotEquals, v)
            } else if let Some((k, v)) = part.split_once("==") {
                (k, FieldOp::Equals, v)
            } else if let Some((k, v)) = part.split_once('=') {
                (k, FieldOp::Equals, v)
            } else {
                return Err(SelectorError::new(part, "expected path=value or path!=value"));
            };
            let path = path.trim();
            if path.is_empty() || path.split('.').any(|seg| seg.is_empty()) {
                return Err(SelectorError::new(part, "invalid field path"));
            }
            requirements.push(FieldRequirement { path: path.to_string(), op, value: value.trim().to_string() });
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, obj: &Json) -> bool {
        self.requirements.iter().all(|r| {
            let have = field_value(obj, &r.path);
            match r.op {
                FieldOp::Equals => have == r.value,
                FieldOp::NotEquals => have != r.value,
            }
        })
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match r.op {
                FieldOp::Equals => format!("{}={}", r.path, r.value),
                FieldOp::NotEquals => format!("{}!={}", r.path, r.value),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Render the scalar at a dotted path. Missing or non-scalar values read as "".
pub fn field_value(obj: &Json, path: &str) -> String {
    let mut cur = obj;
    for seg in path.split('.') {
        match cur.get(seg) {
            Some(next) => cur = next,
            None => return String::new(),
        }
    }
    match cur {
        Json::String(s) => s.clone(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
