//! Label selectors: `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`, `k`, `!k`.

use std::fmt;

use smallvec::SmallVec;

use crate::SelectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOp {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRequirement {
    pub key: String,
    pub op: LabelOp,
    pub values: SmallVec<[String; 2]>,
}

impl LabelRequirement {
    fn matches<'a>(&self, get: &impl Fn(&str) -> Option<&'a str>) -> bool {
        let have = get(&self.key);
        match self.op {
            LabelOp::Exists => have.is_some(),
            LabelOp::DoesNotExist => have.is_none(),
            LabelOp::Equals | LabelOp::In => have.map(|v| self.values.iter().any(|x| x == v)).unwrap_or(false),
            LabelOp::NotEquals | LabelOp::NotIn => have.map(|v| !self.values.iter().any(|x| x == v)).unwrap_or(true),
        }
    }
}

impl fmt::Display for LabelRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            LabelOp::Exists => write!(f, "{}", self.key),
            LabelOp::DoesNotExist => write!(f, "!{}", self.key),
            LabelOp::Equals => write!(f, "{}={}", self.key, self.values[0]),
            LabelOp::NotEquals => write!(f, "{}!={}", self.key, self.values[0]),
            LabelOp::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            LabelOp::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
        }
    }
}

/// Conjunction of label requirements; empty selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: SmallVec<[LabelRequirement; 4]>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[LabelRequirement] {
        &self.requirements
    }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let mut requirements = SmallVec::new();
        for raw in split_top_level(s)? {
            let part = raw.trim();
            if part.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(part)?);
        }
        Ok(Self { requirements })
    }

    /// Evaluate against a label lookup.
    pub fn matches<'a>(&self, get: impl Fn(&str) -> Option<&'a str>) -> bool {
        self.requirements.iter().all(|r| r.matches(&get))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

// Split on commas that are not inside a `( ... )` value set.
fn split_top_level(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => {
                if depth > 0 {
                    return Err(SelectorError::new(s, "nested parentheses"));
                }
                depth += 1;
            }
            ')' => {
                if depth == 0 {
                    return Err(SelectorError::new(s, "unbalanced ')'"));
                }
                depth -= 1;
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::new(s, "unbalanced '('"));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn parse_requirement(part: &str) -> Result<LabelRequirement, SelectorError> {
    if let Some(key) = part.strip_prefix('!') {
        let key = key.trim();
        validate_key(part, key)?;
        return Ok(LabelRequirement { key: key.to_string(), op: LabelOp::DoesNotExist, values: SmallVec::new() });
    }
    if let Some((key, rest)) = part.split_once(char::is_whitespace) {
        let rest = rest.trim_start();
        let (op, set) = if let Some(set) = rest.strip_prefix("notin") {
            (LabelOp::NotIn, set)
        } else if let Some(set) = rest.strip_prefix("in") {
            (LabelOp::In, set)
        } else {
            return parse_comparison(part);
        };
        let key = key.trim();
        validate_key(part, key)?;
        let values = parse_set(part, set.trim())?;
        return Ok(LabelRequirement { key: key.to_string(), op, values });
    }
    parse_comparison(part)
}

fn parse_comparison(part: &str) -> Result<LabelRequirement, SelectorError> {
    let (key, op, value) = if let Some((k, v)) = part.split_once("!=") {
        (k, LabelOp::NotEquals, v)
    } else if let Some((k, v)) = part.split_once("==") {
        (k, LabelOp::Equals, v)
    } else if let Some((k, v)) = part.split_once('=') {
        (k, LabelOp::Equals, v)
    } else {
        let key = part.trim();
        validate_key(part, key)?;
        return Ok(LabelRequirement { key: key.to_string(), op: LabelOp::Exists, values: SmallVec::new() });
    };
    let key = key.trim();
    let value = value.trim();
    validate_key(part, key)?;
    validate_value(part, value)?;
    let mut values = SmallVec::new();
    values.push(value.to_string());
    Ok(LabelRequirement { key: key.to_string(), op, values })
}

fn parse_set(part: &str, set: &str) -> Result<SmallVec<[String; 2]>, SelectorError> {
    let inner = set
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| SelectorError::new(part, "expected '(' value list ')'"))?;
    let mut values = SmallVec::new();
    for v in inner.split(',') {
        let v = v.trim();
        validate_value(part, v)?;
        values.push(v.to_string());
    }
    if values.is_empty() {
        return Err(SelectorError::new(part, "empty value set"));
    }
    Ok(values)
}

fn validate_key(part: &str, key: &str) -> Result<(), SelectorError> {
    if key.is_empty() {
        return Err(SelectorError::new(part, "empty key"));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')) {
        return Err(SelectorError::new(part, "invalid key"));
    }
    Ok(())
}

fn validate_value(part: &str, value: &str) -> Result<(), SelectorError> {
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(SelectorError::new(part, "invalid value"));
    }
    Ok(())
}
