//! Canonical key paths: `/group/<g>/resource/<r>[/namespace/<ns>][/name/<name>]`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{StorageError, StorageResult};

/// The group/resource pair an engine instance serves.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), resource: resource.into() }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// Structured address of a resource (or a collection, when `name` is empty).
///
/// An empty `namespace` is cluster scope. The resource version is never part
/// of identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(gr: &GroupResource, namespace: &str, name: &str) -> Self {
        Self {
            group: gr.group.clone(),
            resource: gr.resource.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn group_resource(&self) -> GroupResource {
        GroupResource::new(self.group.clone(), self.resource.clone())
    }

    /// True when the key addresses a collection rather than one object.
    pub fn is_collection(&self) -> bool {
        self.name.is_empty()
    }

    /// True when `other` lives under this key (itself, or a member of this collection).
    pub fn contains(&self, other: &ResourceKey) -> bool {
        if self.group != other.group || self.resource != other.resource {
            return false;
        }
        if !self.namespace.is_empty() && self.namespace != other.namespace {
            return false;
        }
        self.name.is_empty() || self.name == other.name
    }

    /// Format the canonical path.
    pub fn to_path(&self) -> String {
        let mut out = format!("/group/{}/resource/{}", self.group, self.resource);
        if !self.namespace.is_empty() {
            out.push_str("/namespace/");
            out.push_str(&self.namespace);
        }
        if !self.name.is_empty() {
            out.push_str("/name/");
            out.push_str(&self.name);
        }
        out
    }

    /// Parse a canonical path. A trailing `/` is accepted for collection prefixes.
    pub fn parse(path: &str) -> StorageResult<Self> {
        let invalid = |why: &str| StorageError::InvalidRequest(format!("invalid key {:?}: {}", path, why));
        let trimmed = path.strip_prefix('/').ok_or_else(|| invalid("must start with '/'"))?;
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty segment"));
        }
        let (group, resource, rest) = match parts.as_slice() {
            ["group", g, "resource", r, rest @ ..] => (*g, *r, rest),
            _ => return Err(invalid("expected /group/<g>/resource/<r>")),
        };
        let mut key = ResourceKey {
            group: group.to_string(),
            resource: resource.to_string(),
            namespace: String::new(),
            name: String::new(),
        };
        match rest {
            [] => {}
            ["namespace", ns] => key.namespace = ns.to_string(),
            ["name", n] => key.name = n.to_string(),
            ["namespace", ns, "name", n] => {
                key.namespace = ns.to_string();
                key.name = n.to_string();
            }
            _ => return Err(invalid("expected [/namespace/<ns>][/name/<name>]")),
        }
        Ok(key)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path())
    }
}

impl std::str::FromStr for ResourceKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKey::parse(s)
    }
}
