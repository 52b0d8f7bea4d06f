use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use strata_blob::{blob_info, plan, LargeObjectSupport, SizePlan};
use strata_core::{
    canonical_bytes, decode, parse_resource_version, storage_value, BlobStoreClient, DeletePreconditions, GroupResource,
    ListRequest, Object, OwnerReference, RequestContext, ResourceClient, ResourceKey, ResourceVersion, SecretStore,
    StorageError, StorageResult, VersionMatch,
};
use strata_secure::{SecureValueCoordinator, SecureValueOutcome};
use strata_watch::{Change, SubscribeRequest, WatchBroadcaster, WatchEvent, Watcher};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, EventSource};
use crate::options::{ContinueToken, GetOptions, ListOptions, ObjectList, Preconditions, WatchOptions};
use crate::relay;

/// Attempt limit of [`StorageEngine::guaranteed_update`].
pub const MAX_UPDATE_ATTEMPTS: u32 = 30;

/// Extra check run against the current object before a delete is issued.
pub type ValidateDeletion<T> = dyn Fn(&T) -> StorageResult<()> + Send + Sync;

struct LargeObjects {
    blobs: Arc<dyn BlobStoreClient>,
    support: Arc<dyn LargeObjectSupport>,
}

struct Inner<T> {
    group_resource: GroupResource,
    client: Arc<dyn ResourceClient>,
    secure: SecureValueCoordinator,
    large_objects: Option<LargeObjects>,
    broadcaster: WatchBroadcaster<T>,
    config: EngineConfig,
    shutdown: CancellationToken,
    relay: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Wires a [`StorageEngine`] to its collaborators.
pub struct EngineBuilder {
    group_resource: GroupResource,
    client: Arc<dyn ResourceClient>,
    secrets: Arc<dyn SecretStore>,
    large_objects: Option<LargeObjects>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Offload oversized specs to `blobs` according to `support`.
    pub fn large_objects(mut self, blobs: Arc<dyn BlobStoreClient>, support: Arc<dyn LargeObjectSupport>) -> Self {
        self.large_objects = Some(LargeObjects { blobs, support });
        self
    }

    /// Build the engine. With [`EventSource::Remote`] this spawns the relay
    /// task and must run inside a Tokio runtime.
    pub fn build<T: Object>(self) -> StorageResult<StorageEngine<T>> {
        if let Some(lo) = self.large_objects.as_ref() {
            if lo.support.group_resource() != &self.group_resource {
                return Err(StorageError::InvalidRequest(format!(
                    "large object support for {} cannot serve {}",
                    lo.support.group_resource(),
                    self.group_resource
                )));
            }
        }
        let engine = StorageEngine {
            inner: Arc::new(Inner {
                broadcaster: WatchBroadcaster::new(self.config.watch),
                group_resource: self.group_resource,
                client: self.client,
                secure: SecureValueCoordinator::new(self.secrets),
                large_objects: self.large_objects,
                config: self.config,
                shutdown: CancellationToken::new(),
                relay: std::sync::Mutex::new(None),
            }),
        };
        if engine.inner.config.event_source == EventSource::Remote {
            let handle = tokio::spawn(relay::run(
                Arc::clone(&engine.inner.client),
                engine.inner.group_resource.clone(),
                engine.inner.broadcaster.clone(),
                engine.inner.config.relay_backoff,
                engine.inner.shutdown.child_token(),
            ));
            *engine.inner.relay.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
        info!(gr = %engine.inner.group_resource, source = ?engine.inner.config.event_source, "storage: engine ready");
        Ok(engine)
    }
}

/// Versioned CRUD, list and watch for one group/resource.
pub struct StorageEngine<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for StorageEngine<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// An object read for modification: the full form (offloaded spec merged
/// back) and, when different, the form actually stored.
struct Fetched<T> {
    object: T,
    stored: Option<T>,
    resource_version: ResourceVersion,
}

impl<T: Object> Fetched<T> {
    fn stored_form(&self) -> &T {
        self.stored.as_ref().unwrap_or(&self.object)
    }
}

/// Result of one read-modify-write attempt.
enum Attempt<T> {
    Done(T),
    /// Preconditions did not hold on the object read.
    Precondition(StorageError),
    /// The update function refused the object.
    Rejected(StorageError),
    /// Lost a race against another writer.
    Raced(StorageError),
    /// No-op against a caller-supplied object that may be stale.
    Unconfirmed,
}

fn elapsed_ms(t0: Instant) -> f64 {
    t0.elapsed().as_secs_f64() * 1000.0
}

impl<T: Object> StorageEngine<T> {
    pub fn builder(group_resource: GroupResource, client: Arc<dyn ResourceClient>, secrets: Arc<dyn SecretStore>) -> EngineBuilder {
        EngineBuilder { group_resource, client, secrets, large_objects: None, config: EngineConfig::default() }
    }

    pub fn group_resource(&self) -> &GroupResource {
        &self.inner.group_resource
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Highest RV this engine has observed.
    pub fn high_watermark(&self) -> ResourceVersion {
        self.inner.broadcaster.high_watermark()
    }

    fn check_key(&self, key: &ResourceKey, needs_name: bool) -> StorageResult<()> {
        let gr = &self.inner.group_resource;
        if key.group != gr.group || key.resource != gr.resource {
            return Err(StorageError::InvalidRequest(format!("key {} does not belong to {}", key, gr)));
        }
        if needs_name && key.name.is_empty() {
            return Err(StorageError::InvalidRequest(format!("key {} does not name an object", key)));
        }
        Ok(())
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(StorageError::InvalidState(format!("storage for {} is shut down", self.inner.group_resource)));
        }
        Ok(())
    }

    fn record(op: &'static str, t0: Instant, res: &StorageResult<impl Sized>) {
        histogram!("storage_op_ms", elapsed_ms(t0), "op" => op);
        match res {
            Ok(_) => {
                counter!("storage_op_total", 1u64, "op" => op);
            }
            Err(e) => {
                counter!("storage_op_errors_total", 1u64, "op" => op);
                debug!(op, error = %e, "storage: operation failed");
            }
        }
    }

    async fn publish(&self, make: impl FnOnce() -> StorageResult<Change<T>>) {
        match self.inner.config.event_source {
            EventSource::Local => match make() {
                Ok(change) => self.inner.broadcaster.notify(change).await,
                Err(e) => warn!(gr = %self.inner.group_resource, error = %e, "storage: cannot render change for watchers"),
            },
            EventSource::Remote => {}
        }
    }

    // ----- encoding -----

    /// Encode for the backend, offloading the spec when the size policy says so.
    async fn encode_for_write(&self, ctx: &RequestContext, key: &ResourceKey, obj: &T) -> StorageResult<Vec<u8>> {
        let mut value = storage_value(obj)?;
        let Some(lo) = self.inner.large_objects.as_ref() else {
            return Ok(serde_json::to_vec(&value)?);
        };
        // A descriptor from the previous version is stale once the full spec is back in hand.
        if let Some(meta) = value.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.remove("blob");
        }
        let raw = serde_json::to_vec(&value)?;
        match plan(lo.support.as_ref(), raw.len())? {
            SizePlan::Inline => Ok(raw),
            SizePlan::Offload => {
                lo.support.deconstruct(ctx, key, lo.blobs.as_ref(), &mut value, &raw).await?;
                Ok(serde_json::to_vec(&value)?)
            }
        }
    }

    /// Decode stored bytes; merges offloaded payloads back when configured.
    async fn decode_full(&self, ctx: &RequestContext, key: &ResourceKey, bytes: &[u8], rv: ResourceVersion) -> StorageResult<Fetched<T>> {
        let stored: T = decode(bytes, rv)?;
        let Some(lo) = self.inner.large_objects.as_ref() else {
            return Ok(Fetched { object: stored, stored: None, resource_version: rv });
        };
        if stored.meta().blob.is_none() {
            return Ok(Fetched { object: stored, stored: None, resource_version: rv });
        }
        let mut value: Json = serde_json::from_slice(bytes)?;
        if blob_info(&value)?.is_some() {
            lo.support.reconstruct(ctx, key, lo.blobs.as_ref(), &mut value).await?;
        }
        let mut object: T = serde_json::from_value(value)?;
        object.set_resource_version(rv);
        Ok(Fetched { object, stored: Some(stored), resource_version: rv })
    }

    async fn fetch(&self, ctx: &RequestContext, key: &ResourceKey) -> StorageResult<Fetched<T>> {
        let stored = ctx.guard(self.inner.client.read(key, None)).await?;
        self.decode_full(ctx, key, &stored.value, stored.resource_version).await
    }

    // ----- create -----

    /// Store a new object at `key`. With `ttl`, the object is deleted once
    /// it expires unless it was replaced in the meantime.
    pub async fn create(&self, ctx: &RequestContext, key: &ResourceKey, obj: T, ttl: Option<Duration>) -> StorageResult<T> {
        let t0 = Instant::now();
        let res = self.create_inner(ctx, key, obj, ttl).await;
        Self::record("create", t0, &res);
        if let Ok(out) = res.as_ref() {
            debug!(key = %key, rv = %out.meta().resource_version, took_ms = %t0.elapsed().as_millis(), "storage: created");
        }
        res
    }

    async fn create_inner(&self, ctx: &RequestContext, key: &ResourceKey, mut obj: T, ttl: Option<Duration>) -> StorageResult<T> {
        self.check_open()?;
        self.check_key(key, true)?;
        if !obj.meta().resource_version.is_empty() {
            return Err(StorageError::InvalidRequest("resourceVersion should not be set on objects to be created".into()));
        }
        self.stamp_new(ctx, key, &mut obj)?;
        let owner = OwnerReference::for_object(key, obj.meta());
        let outcome = self.inner.secure.prepare(ctx, &owner, obj.meta_mut(), None).await?;
        let res = self.persist_create(ctx, key, &obj).await;
        let created = self.settle(ctx, outcome, res).await?;

        if let Some(ttl) = ttl {
            self.schedule_expiry(key.clone(), created.object.meta().uid.clone(), ttl);
        }
        self.inner.broadcaster.observe(created.resource_version);
        self.publish(|| Change::added(key.clone(), created.stored_form().clone())).await;
        Ok(created.object)
    }

    fn stamp_new(&self, ctx: &RequestContext, key: &ResourceKey, obj: &mut T) -> StorageResult<()> {
        let meta = obj.meta_mut();
        if meta.name.is_empty() {
            meta.name = key.name.clone();
        } else if meta.name != key.name {
            return Err(StorageError::InvalidRequest(format!("object name {:?} does not match key {}", meta.name, key)));
        }
        if meta.namespace.is_empty() {
            meta.namespace = key.namespace.clone();
        } else if meta.namespace != key.namespace {
            return Err(StorageError::InvalidRequest(format!(
                "object namespace {:?} does not match key {}",
                meta.namespace, key
            )));
        }
        if meta.uid.is_empty() {
            meta.uid = uuid::Uuid::new_v4().to_string();
        }
        meta.creation_timestamp = Some(Utc::now());
        meta.generation = 1;
        meta.created_by = ctx.user().unwrap_or_default().to_string();
        meta.updated_by.clear();
        meta.updated_timestamp = None;
        Ok(())
    }

    async fn persist_create(&self, ctx: &RequestContext, key: &ResourceKey, obj: &T) -> StorageResult<Fetched<T>> {
        let bytes = self.encode_for_write(ctx, key, obj).await?;
        let stored = ctx.guard(self.inner.client.create(key, bytes)).await?;
        Self::written(obj, decode(&stored.value, stored.resource_version)?)
    }

    async fn persist_update(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        obj: &T,
        expected: ResourceVersion,
    ) -> StorageResult<Fetched<T>> {
        let bytes = self.encode_for_write(ctx, key, obj).await?;
        let stored = ctx.guard(self.inner.client.update(key, bytes, expected)).await?;
        Self::written(obj, decode(&stored.value, stored.resource_version)?)
    }

    /// Pair the backend's response with the caller's full spec when it was offloaded.
    fn written(obj: &T, stored: T) -> StorageResult<Fetched<T>> {
        let resource_version = stored.resource_version()?;
        if stored.meta().blob.is_none() {
            return Ok(Fetched { object: stored, stored: None, resource_version });
        }
        let mut full = obj.clone();
        *full.meta_mut() = stored.meta().clone();
        Ok(Fetched { object: full, stored: Some(stored), resource_version })
    }

    /// Finish secure value bookkeeping for a write and hand back its result.
    async fn settle<R>(&self, ctx: &RequestContext, outcome: SecureValueOutcome, res: StorageResult<R>) -> StorageResult<R> {
        match res {
            Ok(v) => {
                self.inner.secure.finish(ctx, outcome, None).await?;
                Ok(v)
            }
            Err(e) => {
                // Always returns the duplicate; the original is surfaced below.
                let _ = self.inner.secure.finish(ctx, outcome, Some(e.duplicate())).await;
                Err(e)
            }
        }
    }

    fn schedule_expiry(&self, key: ResourceKey, uid: String, ttl: Duration) {
        let engine = self.clone();
        let shutdown = self.inner.shutdown.child_token();
        debug!(key = %key, ttl_ms = %ttl.as_millis(), "storage: ttl scheduled");
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(ttl) => {}
            }
            let ctx = RequestContext::background().with_user("system:ttl");
            match engine.delete(&ctx, &key, &Preconditions::uid(uid), None, None).await {
                Ok(_) => {
                    counter!("storage_ttl_expired_total", 1u64);
                    debug!(key = %key, "storage: ttl expired");
                }
                Err(e) if e.is_not_found() || e.is_conflict() => debug!(key = %key, error = %e, "storage: ttl target already gone"),
                Err(e) => warn!(key = %key, error = %e, "storage: ttl delete failed"),
            }
        });
    }

    // ----- get -----

    pub async fn get(&self, ctx: &RequestContext, key: &ResourceKey, opts: &GetOptions) -> StorageResult<T> {
        let t0 = Instant::now();
        let res = self.get_inner(ctx, key, opts).await;
        Self::record("get", t0, &res);
        res
    }

    async fn get_inner(&self, ctx: &RequestContext, key: &ResourceKey, opts: &GetOptions) -> StorageResult<T> {
        self.check_open()?;
        self.check_key(key, true)?;
        let min_rv = parse_resource_version(&opts.resource_version)?;
        let fetched = match self.fetch(ctx, key).await {
            Ok(f) => f,
            Err(e) if e.is_not_found() && opts.ignore_not_found => return Ok(T::default()),
            Err(e) => return Err(e),
        };
        if min_rv > 0 && fetched.resource_version < min_rv {
            return Err(StorageError::TooLargeResourceVersion { requested: min_rv, actual: fetched.resource_version });
        }
        Ok(fetched.object)
    }

    // ----- list -----

    pub async fn get_list(&self, ctx: &RequestContext, key: &ResourceKey, opts: &ListOptions) -> StorageResult<ObjectList<T>> {
        let t0 = Instant::now();
        let res = self.get_list_inner(ctx, key, opts).await;
        Self::record("list", t0, &res);
        if let Ok(list) = res.as_ref() {
            debug!(key = %key, items = list.items.len(), rv = list.resource_version, more = !list.continue_token.is_empty(), took_ms = %t0.elapsed().as_millis(), "storage: listed");
        }
        res
    }

    async fn get_list_inner(&self, ctx: &RequestContext, key: &ResourceKey, opts: &ListOptions) -> StorageResult<ObjectList<T>> {
        self.check_open()?;
        self.check_key(key, false)?;
        let pred = &opts.predicate;
        let requested = parse_resource_version(&opts.resource_version)?;
        if opts.resource_version_match != VersionMatch::Unset && opts.resource_version.is_empty() {
            return Err(StorageError::InvalidRequest(
                "resourceVersionMatch is forbidden unless resourceVersion is provided".into(),
            ));
        }
        if !pred.continue_token.is_empty() && requested > 0 {
            return Err(StorageError::InvalidRequest("specifying resource version is not allowed when using continue".into()));
        }
        if opts.resource_version_match == VersionMatch::Exact && requested == 0 {
            return Err(StorageError::InvalidRequest("resourceVersionMatch Exact requires a non-zero resourceVersion".into()));
        }

        let limit = pred.limit.max(0) as usize;
        let page_size = if limit > 0 { limit as i64 } else { self.inner.config.list_page_size };
        let mut req = ListRequest { key: key.clone(), limit: page_size, ..Default::default() };
        let mut skip = 0usize;
        let resumed = !pred.continue_token.is_empty();
        if resumed {
            let tok = ContinueToken::decode(&pred.continue_token)?;
            req.resource_version = tok.rv;
            req.version_match = VersionMatch::Exact;
            req.next_page_token = tok.start;
            skip = tok.skip;
        } else if requested > 0 {
            req.resource_version = requested;
            req.version_match = match opts.resource_version_match {
                VersionMatch::Exact => VersionMatch::Exact,
                _ => VersionMatch::NotOlderThan,
            };
        }

        let mut items: Vec<T> = Vec::new();
        let mut list_rv: ResourceVersion = 0;
        let mut continue_token = String::new();
        'pages: loop {
            let resp = ctx.guard(self.inner.client.list(req.clone())).await?;
            if list_rv == 0 {
                list_rv = resp.resource_version;
                if !resumed && requested > 0 && req.version_match == VersionMatch::NotOlderThan && list_rv < requested {
                    return Err(StorageError::TooLargeResourceVersion { requested, actual: list_rv });
                }
                // Later pages must be served at the same version.
                req.resource_version = list_rv;
                req.version_match = VersionMatch::Exact;
            }
            let page_len = resp.items.len();
            for (idx, item) in resp.items.into_iter().enumerate().skip(skip) {
                let obj: T = decode(&item.value, item.resource_version)?;
                if pred.matches(&obj) {
                    items.push(obj);
                }
                if limit > 0 && items.len() >= limit {
                    let next = if idx + 1 < page_len {
                        Some(ContinueToken { rv: list_rv, start: req.next_page_token.clone(), skip: idx + 1 })
                    } else if !resp.next_page_token.is_empty() {
                        Some(ContinueToken { rv: list_rv, start: resp.next_page_token.clone(), skip: 0 })
                    } else {
                        None
                    };
                    if let Some(tok) = next {
                        continue_token = tok.encode()?;
                    }
                    break 'pages;
                }
            }
            skip = 0;
            if resp.next_page_token.is_empty() {
                break;
            }
            req.next_page_token = resp.next_page_token;
        }
        self.inner.broadcaster.observe(list_rv);
        Ok(ObjectList { items, resource_version: list_rv, continue_token })
    }

    // ----- delete -----

    /// Delete the object at `key`. Preconditions and `validate` are checked
    /// against the current object (or `cached`), refreshing once on mismatch.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        preconditions: &Preconditions,
        validate: Option<&ValidateDeletion<T>>,
        cached: Option<T>,
    ) -> StorageResult<T> {
        let t0 = Instant::now();
        let res = self.delete_inner(ctx, key, preconditions, validate, cached).await;
        Self::record("delete", t0, &res);
        if let Ok(out) = res.as_ref() {
            debug!(key = %key, rv = %out.meta().resource_version, took_ms = %t0.elapsed().as_millis(), "storage: deleted");
        }
        res
    }

    async fn read_stored(&self, ctx: &RequestContext, key: &ResourceKey) -> StorageResult<T> {
        let stored = ctx.guard(self.inner.client.read(key, None)).await?;
        decode(&stored.value, stored.resource_version)
    }

    async fn delete_inner(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        preconditions: &Preconditions,
        validate: Option<&ValidateDeletion<T>>,
        cached: Option<T>,
    ) -> StorageResult<T> {
        self.check_open()?;
        self.check_key(key, true)?;
        let mut current = match cached {
            Some(obj) => obj,
            None => self.read_stored(ctx, key).await?,
        };
        let mut refreshed = false;
        let deleted_rv = loop {
            let checks = preconditions.check(key, current.meta()).and_then(|_| match validate {
                Some(v) => v(&current),
                None => Ok(()),
            });
            if let Err(e) = checks {
                if refreshed {
                    return Err(e);
                }
                refreshed = true;
                current = self.read_stored(ctx, key).await?;
                continue;
            }
            let uid = current.meta().uid.clone();
            let pre = DeletePreconditions {
                resource_version: Some(current.resource_version()?),
                uid: if uid.is_empty() { None } else { Some(uid) },
            };
            match ctx.guard(self.inner.client.delete(key, pre)).await {
                Ok(rv) => break rv,
                Err(e) if e.is_conflict() && !refreshed => {
                    debug!(key = %key, "storage: delete raced; refreshing once");
                    refreshed = true;
                    current = self.read_stored(ctx, key).await?;
                }
                Err(e) => return Err(e),
            }
        };

        current.set_resource_version(deleted_rv);
        if current.meta().secure_values.is_some() {
            let owner = OwnerReference::for_object(key, current.meta());
            let mut meta = current.meta().clone();
            if let Err(e) = self.inner.secure.handle_delete(ctx, &owner, &mut meta).await {
                counter!("storage_secure_delete_errors_total", 1u64);
                warn!(key = %key, error = %e, "storage: secure values not fully removed");
            }
        }
        self.inner.broadcaster.observe(deleted_rv);
        self.publish(|| Change::deleted(key.clone(), current.clone())).await;
        Ok(current)
    }

    // ----- guaranteed update -----

    /// Read-modify-write with optimistic concurrency.
    ///
    /// `try_update` receives the current object (or `T::default()` when absent
    /// and `ignore_not_found`). Returning an object whose canonical encoding is
    /// unchanged is a no-op. Up to [`MAX_UPDATE_ATTEMPTS`] attempts are made.
    pub async fn guaranteed_update<F>(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        ignore_not_found: bool,
        preconditions: &Preconditions,
        mut try_update: F,
        cached: Option<T>,
    ) -> StorageResult<T>
    where
        F: FnMut(T) -> StorageResult<T> + Send,
    {
        let t0 = Instant::now();
        let res = self.guaranteed_update_inner(ctx, key, ignore_not_found, preconditions, &mut try_update, cached).await;
        Self::record("update", t0, &res);
        res
    }

    async fn guaranteed_update_inner<F>(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        ignore_not_found: bool,
        preconditions: &Preconditions,
        try_update: &mut F,
        mut cached: Option<T>,
    ) -> StorageResult<T>
    where
        F: FnMut(T) -> StorageResult<T> + Send,
    {
        self.check_open()?;
        self.check_key(key, true)?;
        // Set only while the most recent attempt failed inside `try_update`.
        let mut rejected: Option<StorageError> = None;
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let from_cache = cached.is_some();
            let current = match cached.take() {
                Some(obj) => {
                    let rv = obj.resource_version()?;
                    Some(Fetched { object: obj, stored: None, resource_version: rv })
                }
                None => match self.fetch(ctx, key).await {
                    Ok(f) => Some(f),
                    Err(e) if e.is_not_found() && ignore_not_found => None,
                    Err(e) => return Err(e),
                },
            };
            match self.update_attempt(ctx, key, preconditions, try_update, current, from_cache).await? {
                Attempt::Done(out) => {
                    histogram!("storage_update_attempts", attempt as f64);
                    return Ok(out);
                }
                Attempt::Precondition(e) | Attempt::Raced(e) => {
                    debug!(key = %key, attempt, error = %e, "storage: update retry");
                    rejected = None;
                }
                Attempt::Rejected(e) => {
                    debug!(key = %key, attempt, error = %e, "storage: update function rejected object");
                    rejected = Some(e);
                }
                Attempt::Unconfirmed => {
                    debug!(key = %key, attempt, "storage: no-op on cached object; re-reading");
                    rejected = None;
                }
            }
        }
        counter!("storage_update_exhausted_total", 1u64);
        warn!(key = %key, attempts = MAX_UPDATE_ATTEMPTS, "storage: update gave up");
        Err(rejected.unwrap_or_else(|| {
            StorageError::Conflict(format!("{}: update did not succeed after {} attempts", key, MAX_UPDATE_ATTEMPTS))
        }))
    }

    async fn update_attempt<F>(
        &self,
        ctx: &RequestContext,
        key: &ResourceKey,
        preconditions: &Preconditions,
        try_update: &mut F,
        current: Option<Fetched<T>>,
        from_cache: bool,
    ) -> StorageResult<Attempt<T>>
    where
        F: FnMut(T) -> StorageResult<T> + Send,
    {
        let base = current.as_ref().map(|f| f.object.clone()).unwrap_or_default();
        if let Err(e) = preconditions.check(key, base.meta()) {
            return Ok(Attempt::Precondition(e));
        }
        let mut updated = match try_update(base.clone()) {
            Ok(u) => u,
            Err(e) => return Ok(Attempt::Rejected(e)),
        };

        let Some(current) = current else {
            return self.update_create(ctx, key, updated).await;
        };

        if canonical_bytes(&updated)? == canonical_bytes(&current.object)? {
            if from_cache {
                return Ok(Attempt::Unconfirmed);
            }
            debug!(key = %key, rv = current.resource_version, "storage: update is a no-op");
            updated.set_resource_version(current.resource_version);
            return Ok(Attempt::Done(updated));
        }

        {
            let prev = current.object.meta();
            let (uid, created, created_by, generation) =
                (prev.uid.clone(), prev.creation_timestamp, prev.created_by.clone(), prev.generation);
            let meta = updated.meta_mut();
            meta.name = key.name.clone();
            meta.namespace = key.namespace.clone();
            meta.uid = uid;
            meta.creation_timestamp = created;
            meta.created_by = created_by;
            meta.generation = generation + 1;
            meta.updated_by = ctx.user().unwrap_or_default().to_string();
            meta.updated_timestamp = Some(Utc::now());
        }
        updated.set_resource_version(0);

        let owner = OwnerReference::for_object(key, updated.meta());
        let outcome = self.inner.secure.prepare(ctx, &owner, updated.meta_mut(), Some(current.object.meta())).await?;
        let res = self.persist_update(ctx, key, &updated, current.resource_version).await;
        let stored = match self.settle(ctx, outcome, res).await {
            Ok(s) => s,
            Err(e @ (StorageError::Conflict(_) | StorageError::NotFound(_))) => return Ok(Attempt::Raced(e)),
            Err(e) => return Err(e),
        };
        self.inner.broadcaster.observe(stored.resource_version);
        let previous = current.stored_form().clone();
        self.publish(|| Change::modified(key.clone(), stored.stored_form().clone(), previous)).await;
        Ok(Attempt::Done(stored.object))
    }

    async fn update_create(&self, ctx: &RequestContext, key: &ResourceKey, mut obj: T) -> StorageResult<Attempt<T>> {
        obj.set_resource_version(0);
        self.stamp_new(ctx, key, &mut obj)?;
        let owner = OwnerReference::for_object(key, obj.meta());
        let outcome = self.inner.secure.prepare(ctx, &owner, obj.meta_mut(), None).await?;
        let res = self.persist_create(ctx, key, &obj).await;
        let created = match self.settle(ctx, outcome, res).await {
            Ok(c) => c,
            Err(e @ StorageError::AlreadyExists(_)) => return Ok(Attempt::Raced(e)),
            Err(e) => return Err(e),
        };
        self.inner.broadcaster.observe(created.resource_version);
        self.publish(|| Change::added(key.clone(), created.stored_form().clone())).await;
        Ok(Attempt::Done(created.object))
    }

    // ----- watch -----

    /// Subscribe to changes under `key`.
    ///
    /// Without a resource version (or with `send_initial_events`), the
    /// current state is delivered first as `Added` events, followed by an
    /// `initial_events_end` bookmark when bookmarks are allowed.
    pub async fn watch(&self, ctx: &RequestContext, key: &ResourceKey, opts: &WatchOptions) -> StorageResult<Watcher<T>> {
        let t0 = Instant::now();
        let res = self.watch_inner(ctx, key, opts).await;
        Self::record("watch", t0, &res);
        res
    }

    async fn watch_inner(&self, ctx: &RequestContext, key: &ResourceKey, opts: &WatchOptions) -> StorageResult<Watcher<T>> {
        self.check_key(key, false)?;
        if self.inner.shutdown.is_cancelled() || ctx.is_cancelled() {
            return Ok(Watcher::closed());
        }
        let requested = parse_resource_version(&opts.resource_version)?;
        let initial_mode = opts.send_initial_events.unwrap_or(requested == 0);
        let mut predicate = opts.predicate.clone();
        predicate.limit = 0;
        predicate.continue_token.clear();

        let (watermark, initial_events) = if initial_mode {
            let list_opts = ListOptions {
                resource_version: if requested > 0 { requested.to_string() } else { String::new() },
                predicate: predicate.clone(),
                ..Default::default()
            };
            let list = match self.get_list(ctx, key, &list_opts).await {
                Ok(list) => list,
                Err(e) => return Self::closed_or_err(key, e),
            };
            let bookmark_rv = list.items.iter().filter_map(|o| o.resource_version().ok()).max().unwrap_or(list.resource_version);
            let mut events: Vec<WatchEvent<T>> = list.items.into_iter().map(WatchEvent::Added).collect();
            if predicate.allow_watch_bookmarks {
                events.push(WatchEvent::Bookmark { resource_version: bookmark_rv, initial_events_end: true });
            }
            (list.resource_version, events)
        } else if requested > 0 {
            // Nothing observed yet: learn where the replay buffer starts.
            if self.inner.broadcaster.floor().is_none() {
                if let Err(e) = self.current_resource_version(ctx).await {
                    return Self::closed_or_err(key, e);
                }
            }
            (requested, Vec::new())
        } else {
            let rv = match self.high_watermark() {
                0 => match self.current_resource_version(ctx).await {
                    Ok(rv) => rv,
                    Err(e) => return Self::closed_or_err(key, e),
                },
                rv => rv,
            };
            (rv, Vec::new())
        };

        counter!("storage_watch_started_total", 1u64);
        debug!(key = %key, watermark, initial = initial_events.len(), "storage: watch registered");
        let req = SubscribeRequest::new(key.clone(), watermark, predicate)
            .with_initial_events(initial_events)
            .with_cancel(ctx.token().child_token());
        Ok(self.inner.broadcaster.subscribe(req).await)
    }

    /// Recoverable watch setup failures end the stream instead of failing the call.
    fn closed_or_err(key: &ResourceKey, e: StorageError) -> StorageResult<Watcher<T>> {
        match e {
            StorageError::Cancelled => Ok(Watcher::closed()),
            StorageError::Transport(ref b) if b.is_retryable() => {
                warn!(key = %key, error = %e, "storage: initial list unavailable; returning closed watch");
                Ok(Watcher::closed())
            }
            other => Err(other),
        }
    }

    // ----- supplementary -----

    /// Current collection RV as reported by the backend.
    pub async fn current_resource_version(&self, ctx: &RequestContext) -> StorageResult<ResourceVersion> {
        self.check_open()?;
        let req = ListRequest { key: ResourceKey::new(&self.inner.group_resource, "", ""), limit: 1, ..Default::default() };
        let resp = ctx.guard(self.inner.client.list(req)).await?;
        self.inner.broadcaster.observe(resp.resource_version);
        Ok(resp.resource_version)
    }

    /// Number of objects stored under `key`.
    pub async fn count(&self, ctx: &RequestContext, key: &ResourceKey) -> StorageResult<usize> {
        self.check_open()?;
        self.check_key(key, false)?;
        let mut req = ListRequest { key: key.clone(), limit: self.inner.config.list_page_size, ..Default::default() };
        let mut total = 0usize;
        loop {
            let resp = ctx.guard(self.inner.client.list(req.clone())).await?;
            total += resp.items.len();
            if resp.next_page_token.is_empty() {
                return Ok(total);
            }
            req.resource_version = resp.resource_version;
            req.version_match = VersionMatch::Exact;
            req.next_page_token = resp.next_page_token;
        }
    }

    pub fn readiness_check(&self) -> StorageResult<()> {
        self.check_open()
    }

    /// Stop all watches and the event relay. Later calls fail with `InvalidState`.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let relay = self.inner.relay.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = relay {
            if let Err(e) = handle.await {
                warn!(error = %e, "storage: relay task ended abnormally");
            }
        }
        self.inner.broadcaster.stop_all().await;
        info!(gr = %self.inner.group_resource, "storage: engine shut down");
    }
}
