//! Strata large-object support: move an oversized `spec` into the blob store,
//! keep a descriptor in `metadata.blob`, and merge it back on demand.
//! Operates on the JSON storage form so it works for any object type.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::{counter, histogram};
use serde_json::Value as Json;
use strata_core::{BlobInfo, BlobStoreClient, GroupResource, RequestContext, ResourceKey, StorageError, StorageResult};
use tracing::debug;

/// Content type used for offloaded specs.
pub const SPEC_CONTENT_TYPE: &str = "application/json";

/// Size policy plus the offload/merge operations for one group/resource.
#[async_trait::async_trait]
pub trait LargeObjectSupport: Send + Sync {
    fn group_resource(&self) -> &GroupResource;

    /// Encoded size above which the spec is offloaded.
    fn threshold(&self) -> usize;

    /// Encoded size above which writes are rejected outright.
    fn max_size(&self) -> usize;

    /// Upload the spec, record the descriptor, shrink the in-memory object.
    /// Does not persist the object itself.
    async fn deconstruct(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        blobs: &dyn BlobStoreClient,
        obj: &mut Json,
        raw: &[u8],
    ) -> StorageResult<()>;

    /// Fetch the blob referenced by `metadata.blob` and restore the spec.
    async fn reconstruct(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        blobs: &dyn BlobStoreClient,
        obj: &mut Json,
    ) -> StorageResult<()>;
}

/// What the write path should do with an encoded object of a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePlan {
    Inline,
    Offload,
}

/// Classify a write against the size policy.
pub fn plan(support: &dyn LargeObjectSupport, size: usize) -> StorageResult<SizePlan> {
    if size > support.max_size() {
        return Err(StorageError::RequestTooLarge { size, max: support.max_size() });
    }
    if size > support.threshold() {
        Ok(SizePlan::Offload)
    } else {
        Ok(SizePlan::Inline)
    }
}

pub type ReduceSpec = Arc<dyn Fn(&mut Json) -> anyhow::Result<()> + Send + Sync>;

/// Offloads the whole `spec` and merges it back by whole-spec overwrite.
#[derive(Clone)]
pub struct BasicLargeObjectSupport {
    pub group_resource: GroupResource,
    pub threshold: usize,
    pub max_size: usize,
    /// Produces the reduced in-row form after the spec has been uploaded.
    pub reduce_spec: ReduceSpec,
}

impl BasicLargeObjectSupport {
    pub fn new(group_resource: GroupResource, threshold: usize, max_size: usize) -> Self {
        Self { group_resource, threshold, max_size, reduce_spec: Arc::new(empty_spec) }
    }

    pub fn with_reducer(mut self, reduce: impl Fn(&mut Json) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.reduce_spec = Arc::new(reduce);
        self
    }
}

impl std::fmt::Debug for BasicLargeObjectSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicLargeObjectSupport")
            .field("group_resource", &self.group_resource)
            .field("threshold", &self.threshold)
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Default reducer: keep an empty spec object.
pub fn empty_spec(obj: &mut Json) -> anyhow::Result<()> {
    if let Some(map) = obj.as_object_mut() {
        map.insert("spec".to_string(), Json::Object(Default::default()));
    }
    Ok(())
}

fn metadata_mut(obj: &mut Json) -> StorageResult<&mut serde_json::Map<String, Json>> {
    let map = obj
        .as_object_mut()
        .ok_or_else(|| StorageError::Internal("object is not a JSON object".into()))?;
    map.entry("metadata")
        .or_insert_with(|| Json::Object(Default::default()))
        .as_object_mut()
        .ok_or_else(|| StorageError::Internal("metadata is not a JSON object".into()))
}

/// Read the blob descriptor from a storage-form object.
pub fn blob_info(obj: &Json) -> StorageResult<Option<BlobInfo>> {
    match obj.get("metadata").and_then(|m| m.get("blob")) {
        None | Some(Json::Null) => Ok(None),
        Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
    }
}

#[async_trait::async_trait]
impl LargeObjectSupport for BasicLargeObjectSupport {
    fn group_resource(&self) -> &GroupResource {
        &self.group_resource
    }

    fn threshold(&self) -> usize {
        self.threshold
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    async fn deconstruct(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        blobs: &dyn BlobStoreClient,
        obj: &mut Json,
        raw: &[u8],
    ) -> StorageResult<()> {
        let spec = match obj.get("spec") {
            Some(s) if !s.is_null() => s.clone(),
            _ => {
                debug!(key = %key, size = raw.len(), "offload: object has no spec; leaving inline");
                return Ok(());
            }
        };
        let payload = serde_json::to_vec(&spec)?;
        let info = ctx.guard(blobs.put_blob(key, payload, SPEC_CONTENT_TYPE)).await?;
        debug!(key = %key, size = raw.len(), blob = %info.uid, blob_size = info.size, "offload: spec moved to blob store");
        metadata_mut(obj)?.insert("blob".to_string(), serde_json::to_value(&info)?);
        (self.reduce_spec)(obj).map_err(|e| StorageError::Internal(format!("reduce spec: {:#}", e)))?;
        counter!("blob_offload_total", 1u64);
        histogram!("blob_offload_bytes", raw.len() as f64);
        Ok(())
    }

    async fn reconstruct(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        blobs: &dyn BlobStoreClient,
        obj: &mut Json,
    ) -> StorageResult<()> {
        let Some(info) = blob_info(obj)? else {
            return Ok(());
        };
        let bytes = ctx.guard(blobs.get_blob(key, &info)).await?;
        if bytes.len() as u64 != info.size {
            return Err(StorageError::Internal(format!(
                "blob {} size mismatch: descriptor {}, fetched {}",
                info.uid,
                info.size,
                bytes.len()
            )));
        }
        let spec: Json = serde_json::from_slice(&bytes)?;
        if let Some(map) = obj.as_object_mut() {
            map.insert("spec".to_string(), spec);
        }
        counter!("blob_reconstruct_total", 1u64);
        Ok(())
    }
}
