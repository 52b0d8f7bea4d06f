//! Strata core types: resource keys, object metadata, errors and the
//! collaborator traits the storage engine is wired against.

#![forbid(unsafe_code)]

pub mod client;
pub mod context;
pub mod error;
pub mod keys;
pub mod object;

pub use client::{
    BackendEvent, BackendEventKind, BackendObject, BlobStoreClient, DeletePreconditions, EventStream,
    ListItem, ListRequest, ListResponse, ResourceClient, SecretStore, VersionMatch, WatchRequest,
};
pub use context::RequestContext;
pub use error::{BackendError, StorageError, StorageResult};
pub use keys::{GroupResource, ResourceKey};
pub use object::{
    canonical_bytes, decode, storage_value, BlobInfo, ManagerProperties, Object, ObjectMeta, OwnerReference, SecureValue,
    SecureValues,
};

/// Resource version as assigned by the backend.
pub type ResourceVersion = u64;

/// Parse a resourceVersion string. Empty means unset and yields `Ok(0)`.
pub fn parse_resource_version(rv: &str) -> StorageResult<ResourceVersion> {
    if rv.is_empty() {
        return Ok(0);
    }
    rv.parse::<u64>()
        .map_err(|_| StorageError::InvalidRequest(format!("invalid resource version: {:?}", rv)))
}
