//! Object model shared by every engine instance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::keys::ResourceKey;
use crate::{parse_resource_version, ResourceVersion};

/// Descriptor of a payload moved out to the blob store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlobInfo {
    pub uid: String,
    pub size: u64,
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub charset: String,
}

/// One entry of the secure value map.
///
/// Only `name` is ever persisted. `create` and `remove` are write-time
/// instructions resolved by the secure value coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecureValue {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub remove: bool,
}

impl SecureValue {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn create(raw: impl Into<String>) -> Self {
        Self { create: Some(raw.into()), ..Default::default() }
    }

    pub fn remove() -> Self {
        Self { remove: true, ..Default::default() }
    }
}

pub type SecureValues = BTreeMap<String, SecureValue>;

/// Manager/ownership properties. Carried verbatim; policy lives elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerProperties {
    pub kind: String,
    pub identity: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allows_edits: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub suspended: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_values: Option<SecureValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerProperties>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Reference used by the secret store to tie secrets to their owning resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OwnerReference {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl OwnerReference {
    pub fn for_object(key: &ResourceKey, meta: &ObjectMeta) -> Self {
        Self {
            group: key.group.clone(),
            resource: key.resource.clone(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            uid: meta.uid.clone(),
        }
    }
}

/// A typed resource the engine can store.
pub trait Object: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn resource_version(&self) -> StorageResult<ResourceVersion> {
        parse_resource_version(&self.meta().resource_version)
    }

    fn set_resource_version(&mut self, rv: ResourceVersion) {
        self.meta_mut().resource_version = if rv == 0 { String::new() } else { rv.to_string() };
    }
}

/// Storage form of an object: JSON with `metadata.resourceVersion` removed.
pub fn storage_value<T: Object>(obj: &T) -> StorageResult<serde_json::Value> {
    let mut v = serde_json::to_value(obj)?;
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("resourceVersion");
    }
    Ok(v)
}

/// Canonical bytes used both for writes and for no-op detection.
pub fn canonical_bytes<T: Object>(obj: &T) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec(&storage_value(obj)?)?)
}

/// Decode backend bytes and stamp the backend-assigned resource version.
pub fn decode<T: Object>(bytes: &[u8], rv: ResourceVersion) -> StorageResult<T> {
    let mut obj: T = serde_json::from_slice(bytes)?;
    obj.set_resource_version(rv);
    Ok(obj)
}
