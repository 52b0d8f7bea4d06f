#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_blob::BasicLargeObjectSupport;
use strata_storage::memory::{MemoryBlobStore, MemoryResourceClient, MemorySecretStore};
use strata_storage::{EngineConfig, GroupResource, Object, ObjectMeta, ResourceKey, StorageEngine, WatchEvent, Watcher};
use tokio::time::timeout;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

impl Object for Pod {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub fn gr() -> GroupResource {
    GroupResource::new("test.strata.io", "pods")
}

pub fn key(ns: &str, name: &str) -> ResourceKey {
    ResourceKey::new(&gr(), ns, name)
}

pub fn all() -> ResourceKey {
    ResourceKey::new(&gr(), "", "")
}

pub fn pod(name: &str, title: &str) -> Pod {
    let mut p = Pod::default();
    p.metadata.name = name.into();
    p.spec.title = title.into();
    p
}

pub struct Harness {
    pub engine: StorageEngine<Pod>,
    pub client: Arc<MemoryResourceClient>,
    pub blobs: Arc<MemoryBlobStore>,
    pub secrets: Arc<MemorySecretStore>,
}

pub fn harness() -> Harness {
    harness_with(MemoryResourceClient::new(), EngineConfig::default(), None)
}

/// `offload` is `(threshold, max_size)` for large-object support.
pub fn harness_with(client: MemoryResourceClient, config: EngineConfig, offload: Option<(usize, usize)>) -> Harness {
    init_tracing();
    let client = Arc::new(client);
    let blobs = Arc::new(MemoryBlobStore::new());
    let secrets = Arc::new(MemorySecretStore::new());
    let mut builder = StorageEngine::<Pod>::builder(gr(), client.clone(), secrets.clone()).config(config);
    if let Some((threshold, max)) = offload {
        builder = builder.large_objects(blobs.clone(), Arc::new(BasicLargeObjectSupport::new(gr(), threshold, max)));
    }
    let engine = builder.build::<Pod>().unwrap();
    Harness { engine, client, blobs, secrets }
}

/// `RUST_LOG=strata_storage=debug cargo test` shows engine logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn next_event(w: &mut Watcher<Pod>) -> WatchEvent<Pod> {
    timeout(Duration::from_secs(2), w.next()).await.expect("timed out waiting for event").expect("watch closed")
}

/// True when nothing arrives within a short grace period.
pub async fn quiet(w: &mut Watcher<Pod>) -> bool {
    timeout(Duration::from_millis(100), w.next()).await.is_err()
}
