//! Collaborators the engine is wired against. Implementations are external;
//! `strata-storage` ships in-memory ones for tests.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::keys::ResourceKey;
use crate::object::{BlobInfo, OwnerReference};
use crate::ResourceVersion;

/// A stored value as returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendObject {
    pub value: Vec<u8>,
    pub resource_version: ResourceVersion,
}

/// Conditions the backend checks atomically before deleting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletePreconditions {
    pub resource_version: Option<ResourceVersion>,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionMatch {
    /// No constraint: the most recent state.
    #[default]
    Unset,
    NotOlderThan,
    Exact,
}

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// Collection key; an empty namespace lists across namespaces.
    pub key: ResourceKey,
    /// Page size; 0 means backend default.
    pub limit: i64,
    pub next_page_token: String,
    pub resource_version: ResourceVersion,
    pub version_match: VersionMatch,
}

#[derive(Debug, Clone, Default)]
pub struct ListItem {
    pub key: ResourceKey,
    pub value: Vec<u8>,
    pub resource_version: ResourceVersion,
}

#[derive(Debug, Clone, Default)]
pub struct ListResponse {
    pub items: Vec<ListItem>,
    /// Collection resource version the page was served at.
    pub resource_version: ResourceVersion,
    /// Empty when there are no more pages.
    pub next_page_token: String,
}

#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    pub key: ResourceKey,
    /// Stream changes strictly after this version.
    pub since: ResourceVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct BackendEvent {
    pub kind: BackendEventKind,
    pub key: ResourceKey,
    pub value: Vec<u8>,
    pub previous: Option<Vec<u8>>,
    pub resource_version: ResourceVersion,
}

pub type EventStream = BoxStream<'static, Result<BackendEvent, BackendError>>;

/// Remote resource backend: durable, versioned, compare-and-swap.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create a new value. Fails with `AlreadyExists` if the key is live.
    async fn create(&self, key: &ResourceKey, value: Vec<u8>) -> Result<BackendObject, BackendError>;

    /// Read the latest value, or the value at `resource_version` when given.
    async fn read(&self, key: &ResourceKey, resource_version: Option<ResourceVersion>) -> Result<BackendObject, BackendError>;

    /// Replace the value if its current version equals `expected`; `Conflict` otherwise.
    async fn update(&self, key: &ResourceKey, value: Vec<u8>, expected: ResourceVersion) -> Result<BackendObject, BackendError>;

    /// Delete and return the version assigned to the deletion.
    async fn delete(&self, key: &ResourceKey, preconditions: DeletePreconditions) -> Result<ResourceVersion, BackendError>;

    async fn list(&self, req: ListRequest) -> Result<ListResponse, BackendError>;

    async fn watch(&self, req: WatchRequest) -> Result<EventStream, BackendError>;
}

#[async_trait::async_trait]
pub trait BlobStoreClient: Send + Sync {
    async fn put_blob(&self, key: &ResourceKey, value: Vec<u8>, content_type: &str) -> Result<BlobInfo, BackendError>;

    async fn get_blob(&self, key: &ResourceKey, info: &BlobInfo) -> Result<Vec<u8>, BackendError>;
}

#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Materialize a raw secret owned by `owner`; returns its generated name.
    async fn create_inline(&self, owner: &OwnerReference, raw: &str) -> Result<String, BackendError>;

    async fn delete_when_owned_by_resource(&self, owner: &OwnerReference, name: &str) -> Result<(), BackendError>;
}
