//! In-memory collaborators: a versioned resource backend with history and a
//! change stream, a content-hashed blob store and a secret store. Used by the
//! tests and for embedding the engine without a remote service.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use strata_core::{
    BackendError, BackendEvent, BackendEventKind, BackendObject, BlobInfo, BlobStoreClient, DeletePreconditions, EventStream,
    ListItem, ListRequest, ListResponse, OwnerReference, ResourceClient, ResourceKey, ResourceVersion, SecretStore, VersionMatch,
    WatchRequest,
};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone)]
struct Revision {
    rv: ResourceVersion,
    /// `None` marks a deletion.
    value: Option<Vec<u8>>,
}

/// What live watch streams receive.
#[derive(Debug, Clone)]
enum Feed {
    Event(BackendEvent),
    /// Ends every open stream with `Unavailable`.
    Interrupt(String),
}

#[derive(Default)]
struct State {
    rv: ResourceVersion,
    revisions: BTreeMap<ResourceKey, Vec<Revision>>,
    log: Vec<BackendEvent>,
}

impl State {
    fn live(&self, key: &ResourceKey, at: ResourceVersion) -> Option<(ResourceVersion, &Vec<u8>)> {
        let rev = self.revisions.get(key)?.iter().rev().find(|r| r.rv <= at)?;
        rev.value.as_ref().map(|v| (rev.rv, v))
    }

    fn latest(&self, key: &ResourceKey) -> Option<(ResourceVersion, &Vec<u8>)> {
        self.live(key, self.rv)
    }

    fn record(&mut self, key: &ResourceKey, value: Option<Vec<u8>>) -> ResourceVersion {
        self.rv += 1;
        let rv = self.rv;
        self.revisions.entry(key.clone()).or_default().push(Revision { rv, value });
        rv
    }
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicUsize,
    lists: AtomicUsize,
    writes: AtomicUsize,
    watches: AtomicUsize,
    fail_lists: AtomicUsize,
}

/// Versioned, compare-and-swap resource store kept in memory.
///
/// Every write takes the next global RV. Full history is retained so lists
/// can be served at an exact past RV, and watches can start anywhere.
pub struct MemoryResourceClient {
    state: Mutex<State>,
    events: broadcast::Sender<Feed>,
    counters: Counters,
}

impl Default for MemoryResourceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResourceClient {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// The first write is assigned `rv + 1`.
    pub fn starting_at(rv: ResourceVersion) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { state: Mutex::new(State { rv, ..Default::default() }), events, counters: Counters::default() }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_rv(&self) -> ResourceVersion {
        self.state().rv
    }

    pub fn read_count(&self) -> usize {
        self.counters.reads.load(Ordering::Relaxed)
    }

    pub fn list_count(&self) -> usize {
        self.counters.lists.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> usize {
        self.counters.writes.load(Ordering::Relaxed)
    }

    pub fn watch_count(&self) -> usize {
        self.counters.watches.load(Ordering::Relaxed)
    }

    /// Make the next `n` list calls fail with `Unavailable`.
    pub fn fail_next_lists(&self, n: usize) {
        self.counters.fail_lists.store(n, Ordering::Relaxed);
    }

    /// Fail every open watch stream, as a dropped connection would.
    pub fn interrupt_watches(&self, reason: &str) {
        let _ = self.events.send(Feed::Interrupt(reason.to_string()));
    }

    /// Raw stored bytes, bypassing the counters.
    pub fn raw(&self, key: &ResourceKey) -> Option<(ResourceVersion, Vec<u8>)> {
        self.state().latest(key).map(|(rv, v)| (rv, v.clone()))
    }

    fn emit(&self, state: &mut State, event: BackendEvent) {
        state.log.push(event.clone());
        // No receivers is fine.
        let _ = self.events.send(Feed::Event(event));
    }
}

fn uid_of(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("metadata")?.get("uid")?.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ResourceClient for MemoryResourceClient {
    async fn create(&self, key: &ResourceKey, value: Vec<u8>) -> Result<BackendObject, BackendError> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        if state.latest(key).is_some() {
            return Err(BackendError::AlreadyExists(key.to_string()));
        }
        let rv = state.record(key, Some(value.clone()));
        let event = BackendEvent { kind: BackendEventKind::Added, key: key.clone(), value: value.clone(), previous: None, resource_version: rv };
        self.emit(&mut state, event);
        debug!(key = %key, rv, "memory: created");
        Ok(BackendObject { value, resource_version: rv })
    }

    async fn read(&self, key: &ResourceKey, resource_version: Option<ResourceVersion>) -> Result<BackendObject, BackendError> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let state = self.state();
        let at = resource_version.unwrap_or(state.rv);
        state
            .live(key, at)
            .map(|(rv, v)| BackendObject { value: v.clone(), resource_version: rv })
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn update(&self, key: &ResourceKey, value: Vec<u8>, expected: ResourceVersion) -> Result<BackendObject, BackendError> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        let (current_rv, previous) = match state.latest(key) {
            Some((rv, v)) => (rv, v.clone()),
            None => return Err(BackendError::NotFound(key.to_string())),
        };
        if current_rv != expected {
            return Err(BackendError::Conflict(format!("{}: expected rv {}, found {}", key, expected, current_rv)));
        }
        let rv = state.record(key, Some(value.clone()));
        let event = BackendEvent {
            kind: BackendEventKind::Modified,
            key: key.clone(),
            value: value.clone(),
            previous: Some(previous),
            resource_version: rv,
        };
        self.emit(&mut state, event);
        Ok(BackendObject { value, resource_version: rv })
    }

    async fn delete(&self, key: &ResourceKey, preconditions: DeletePreconditions) -> Result<ResourceVersion, BackendError> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        let (current_rv, last) = match state.latest(key) {
            Some((rv, v)) => (rv, v.clone()),
            None => return Err(BackendError::NotFound(key.to_string())),
        };
        if let Some(expected) = preconditions.resource_version {
            if expected != current_rv {
                return Err(BackendError::Conflict(format!("{}: expected rv {}, found {}", key, expected, current_rv)));
            }
        }
        if let Some(uid) = preconditions.uid.as_deref() {
            let have = uid_of(&last);
            if uid != have {
                return Err(BackendError::Conflict(format!("{}: expected uid {}, found {}", key, uid, have)));
            }
        }
        let rv = state.record(key, None);
        let event = BackendEvent { kind: BackendEventKind::Deleted, key: key.clone(), value: last.clone(), previous: Some(last), resource_version: rv };
        self.emit(&mut state, event);
        Ok(rv)
    }

    async fn list(&self, req: ListRequest) -> Result<ListResponse, BackendError> {
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        let pending_failures = self.counters.fail_lists.load(Ordering::Relaxed);
        if pending_failures > 0 {
            self.counters.fail_lists.store(pending_failures - 1, Ordering::Relaxed);
            return Err(BackendError::Unavailable("injected list failure".into()));
        }
        let state = self.state();
        let at = match req.version_match {
            VersionMatch::Exact if req.resource_version > 0 => {
                if req.resource_version > state.rv {
                    return Err(BackendError::FutureVersion { requested: req.resource_version, current: state.rv });
                }
                req.resource_version
            }
            _ => state.rv,
        };
        let lower = if req.next_page_token.is_empty() {
            Bound::Unbounded
        } else {
            let after = ResourceKey::parse(&req.next_page_token)
                .map_err(|e| BackendError::Other(anyhow!("invalid page token: {}", e)))?;
            Bound::Excluded(after)
        };
        let limit = if req.limit > 0 { req.limit as usize } else { usize::MAX };
        let mut items = Vec::new();
        let mut next_page_token = String::new();
        for key in state.revisions.range((lower, Bound::Unbounded)).map(|(k, _)| k) {
            if !req.key.contains(key) {
                continue;
            }
            if let Some((rv, v)) = state.live(key, at) {
                if items.len() == limit {
                    next_page_token = items.last().map(|i: &ListItem| i.key.to_path()).unwrap_or_default();
                    break;
                }
                items.push(ListItem { key: key.clone(), value: v.clone(), resource_version: rv });
            }
        }
        Ok(ListResponse { items, resource_version: at, next_page_token })
    }

    async fn watch(&self, req: WatchRequest) -> Result<EventStream, BackendError> {
        self.counters.watches.fetch_add(1, Ordering::Relaxed);
        let (replay, rx) = {
            let state = self.state();
            let replay: Vec<BackendEvent> = state
                .log
                .iter()
                .filter(|e| e.resource_version > req.since && req.key.contains(&e.key))
                .cloned()
                .collect();
            (replay, self.events.subscribe())
        };
        let last = replay.last().map(|e| e.resource_version).unwrap_or(req.since);
        let scope = req.key;
        let live = futures::stream::unfold((rx, last, scope), |(mut rx, last, scope)| async move {
            loop {
                match rx.recv().await {
                    Ok(Feed::Event(ev)) => {
                        if ev.resource_version > last && scope.contains(&ev.key) {
                            let rv = ev.resource_version;
                            return Some((Ok(ev), (rx, rv, scope)));
                        }
                    }
                    Ok(Feed::Interrupt(reason)) => {
                        return Some((Err(BackendError::Unavailable(reason)), (rx, last, scope)));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Some((Err(BackendError::Unavailable(format!("watch lagged by {} events", n))), (rx, last, scope)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(futures::stream::iter(replay.into_iter().map(Ok)).chain(live).boxed())
    }
}

/// Blob store keyed by generated uid; records a SHA-256 of each payload.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    gets: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait::async_trait]
impl BlobStoreClient for MemoryBlobStore {
    async fn put_blob(&self, key: &ResourceKey, value: Vec<u8>, content_type: &str) -> Result<BlobInfo, BackendError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let info = BlobInfo {
            uid: uuid::Uuid::new_v4().to_string(),
            size: value.len() as u64,
            hash: sha256_hex(&value),
            mime_type: content_type.to_string(),
            charset: "utf-8".to_string(),
        };
        debug!(key = %key, blob = %info.uid, size = info.size, "memory: blob stored");
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).insert(info.uid.clone(), value);
        Ok(info)
    }

    async fn get_blob(&self, key: &ResourceKey, info: &BlobInfo) -> Result<Vec<u8>, BackendError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let bytes = self
            .blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&info.uid)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("blob {} for {}", info.uid, key)))?;
        if !info.hash.is_empty() && sha256_hex(&bytes) != info.hash {
            return Err(BackendError::Other(anyhow!("blob {} hash mismatch", info.uid)));
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone)]
struct StoredSecret {
    owner_uid: String,
    raw: String,
}

/// Secret store that tracks ownership by the owning resource's uid.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<String, StoredSecret>>,
    next: AtomicU64,
    deleted: Mutex<Vec<String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn secrets(&self) -> MutexGuard<'_, BTreeMap<String, StoredSecret>> {
        self.secrets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.secrets().contains_key(name)
    }

    pub fn raw_value(&self, name: &str) -> Option<String> {
        self.secrets().get(name).map(|s| s.raw.clone())
    }

    pub fn len(&self) -> usize {
        self.secrets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names deleted so far, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Seed a secret, as if created by an earlier write.
    pub fn insert(&self, owner: &OwnerReference, name: &str, raw: &str) {
        self.secrets().insert(name.to_string(), StoredSecret { owner_uid: owner.uid.clone(), raw: raw.to_string() });
    }
}

#[async_trait::async_trait]
impl SecretStore for MemorySecretStore {
    async fn create_inline(&self, owner: &OwnerReference, raw: &str) -> Result<String, BackendError> {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}-inline-{}", owner.name, n);
        self.insert(owner, &name, raw);
        Ok(name)
    }

    async fn delete_when_owned_by_resource(&self, owner: &OwnerReference, name: &str) -> Result<(), BackendError> {
        let mut secrets = self.secrets();
        let owned = match secrets.get(name) {
            None => return Err(BackendError::NotFound(format!("secure value {}", name))),
            Some(s) => s.owner_uid == owner.uid,
        };
        if !owned {
            return Err(BackendError::Conflict(format!("secure value {} is not owned by {}", name, owner.uid)));
        }
        secrets.remove(name);
        drop(secrets);
        self.deleted.lock().unwrap_or_else(|e| e.into_inner()).push(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::GroupResource;

    fn key(ns: &str, name: &str) -> ResourceKey {
        ResourceKey::new(&GroupResource::new("g", "r"), ns, name)
    }

    #[tokio::test]
    async fn versions_and_cas() {
        let c = MemoryResourceClient::starting_at(999);
        let created = c.create(&key("ns", "a"), b"{}".to_vec()).await.unwrap();
        assert_eq!(created.resource_version, 1000);
        assert!(matches!(c.create(&key("ns", "a"), b"{}".to_vec()).await, Err(BackendError::AlreadyExists(_))));
        assert!(matches!(c.update(&key("ns", "a"), b"{\"x\":1}".to_vec(), 999).await, Err(BackendError::Conflict(_))));
        let updated = c.update(&key("ns", "a"), b"{\"x\":1}".to_vec(), 1000).await.unwrap();
        assert_eq!(updated.resource_version, 1001);
        assert_eq!(c.read(&key("ns", "a"), Some(1000)).await.unwrap().value, b"{}".to_vec());
        let deleted = c.delete(&key("ns", "a"), DeletePreconditions { resource_version: Some(1001), uid: None }).await.unwrap();
        assert_eq!(deleted, 1002);
        assert!(matches!(c.read(&key("ns", "a"), None).await, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn paged_list_at_exact_version() {
        let c = MemoryResourceClient::new();
        for n in ["a", "b", "c"] {
            c.create(&key("ns", n), b"{}".to_vec()).await.unwrap();
        }
        c.create(&key("other", "z"), b"{}".to_vec()).await.unwrap();
        let collection = key("ns", "");
        let first = c.list(ListRequest { key: collection.clone(), limit: 2, ..Default::default() }).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.resource_version, 4);
        c.delete(&key("ns", "c"), DeletePreconditions::default()).await.unwrap();
        let second = c
            .list(ListRequest {
                key: collection,
                limit: 2,
                next_page_token: first.next_page_token.clone(),
                resource_version: first.resource_version,
                version_match: VersionMatch::Exact,
            })
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1, "c is still visible at the first page's version");
        assert_eq!(second.items[0].key.name, "c");
        assert!(second.next_page_token.is_empty());
    }

    #[tokio::test]
    async fn watch_replays_then_streams() {
        let c = MemoryResourceClient::new();
        c.create(&key("ns", "a"), b"{}".to_vec()).await.unwrap();
        c.create(&key("ns", "b"), b"{}".to_vec()).await.unwrap();
        let mut s = c.watch(WatchRequest { key: key("ns", ""), since: 1 }).await.unwrap();
        assert_eq!(s.next().await.unwrap().unwrap().resource_version, 2);
        c.delete(&key("ns", "a"), DeletePreconditions::default()).await.unwrap();
        let ev = s.next().await.unwrap().unwrap();
        assert_eq!(ev.kind, BackendEventKind::Deleted);
        assert_eq!(ev.resource_version, 3);
        c.interrupt_watches("connection reset");
        assert!(matches!(s.next().await, Some(Err(BackendError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn blobs_are_hashed() {
        let b = MemoryBlobStore::new();
        let info = b.put_blob(&key("ns", "a"), b"payload".to_vec(), "application/json").await.unwrap();
        assert_eq!(info.size, 7);
        assert_eq!(info.hash.len(), 64);
        assert_eq!(b.get_blob(&key("ns", "a"), &info).await.unwrap(), b"payload".to_vec());
    }

    #[tokio::test]
    async fn secrets_respect_ownership() {
        let s = MemorySecretStore::new();
        let owner = OwnerReference { name: "a".into(), uid: "u1".into(), ..Default::default() };
        let stranger = OwnerReference { name: "a".into(), uid: "u2".into(), ..Default::default() };
        let name = s.create_inline(&owner, "hunter2").await.unwrap();
        assert_eq!(s.raw_value(&name).as_deref(), Some("hunter2"));
        assert!(s.delete_when_owned_by_resource(&stranger, &name).await.is_err());
        s.delete_when_owned_by_resource(&owner, &name).await.unwrap();
        assert!(!s.contains(&name));
        assert_eq!(s.deleted(), vec![name]);
    }
}
