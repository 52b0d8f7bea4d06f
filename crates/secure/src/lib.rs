//! Strata secure values: reconcile the `secureValues` map of a resource
//! against its previous stored version, materializing inline secrets before
//! the write and deleting orphaned ones only after the write succeeded.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use metrics::counter;
use strata_core::{ObjectMeta, OwnerReference, RequestContext, SecretStore, SecureValue, SecureValues, StorageError, StorageResult};
use tracing::{debug, warn};

/// Bookkeeping produced by [`prepare_secure_values`] and consumed by
/// [`SecureValueOutcome::finish`] once the resource write has completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecureValueOutcome {
    pub owner: OwnerReference,
    /// Secrets materialized by this write; rolled back if the write fails.
    pub created: Vec<String>,
    /// Secrets no longer referenced; deleted only if the write succeeds.
    pub pending_deletes: Vec<String>,
}

impl SecureValueOutcome {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.pending_deletes.is_empty()
    }

    /// Complete the write. On `Some(err)` nothing queued is deleted, secrets
    /// created for this write are rolled back, and `err` is returned as is.
    pub async fn finish(self, ctx: &RequestContext, write_err: Option<StorageError>, store: &dyn SecretStore) -> StorageResult<()> {
        if let Some(err) = write_err {
            if !self.created.is_empty() {
                debug!(owner = %self.owner.name, created = self.created.len(), "secure values: write failed; rolling back created");
                rollback(ctx, store, &self.owner, &self.created).await;
            }
            return Err(err);
        }
        for name in self.pending_deletes.iter() {
            match ctx.guard(store.delete_when_owned_by_resource(&self.owner, name)).await {
                Ok(()) => counter!("secure_values_deleted_total", 1u64),
                Err(e) => {
                    counter!("secure_values_delete_errors_total", 1u64);
                    warn!(owner = %self.owner.name, name = %name, error = %e, "secure values: failed to delete unreferenced secret");
                }
            }
        }
        Ok(())
    }
}

async fn rollback(ctx: &RequestContext, store: &dyn SecretStore, owner: &OwnerReference, created: &[String]) {
    for name in created {
        if let Err(e) = ctx.guard(store.delete_when_owned_by_resource(owner, name)).await {
            warn!(owner = %owner.name, name = %name, error = %e, "secure values: rollback delete failed");
        }
    }
}

fn has_values(map: Option<&SecureValues>) -> bool {
    map.map(|m| !m.is_empty()).unwrap_or(false)
}

/// Resolve every entry of `new_meta.secureValues` to a `{name}` reference.
///
/// Entries omitted from the new map are carried over from `previous`; only
/// explicit `remove` or a changed name queues a secret for deletion.
pub async fn prepare_secure_values(
    ctx: &RequestContext,
    store: &dyn SecretStore,
    owner: &OwnerReference,
    new_meta: &mut ObjectMeta,
    previous: Option<&ObjectMeta>,
) -> StorageResult<SecureValueOutcome> {
    let mut outcome = SecureValueOutcome { owner: owner.clone(), ..Default::default() };
    let prev = previous.and_then(|p| p.secure_values.as_ref());
    if !has_values(new_meta.secure_values.as_ref()) && !has_values(prev) {
        return Ok(outcome);
    }

    let requested = new_meta.secure_values.take().unwrap_or_default();
    match resolve(ctx, store, owner, requested, prev, &mut outcome).await {
        Ok(resolved) => {
            new_meta.secure_values = if resolved.is_empty() { None } else { Some(resolved) };
            if !outcome.is_noop() {
                debug!(owner = %owner.name, created = outcome.created.len(), deletes = outcome.pending_deletes.len(), "secure values prepared");
            }
            Ok(outcome)
        }
        Err(e) => {
            rollback(ctx, store, owner, &outcome.created).await;
            Err(e)
        }
    }
}

async fn resolve(
    ctx: &RequestContext,
    store: &dyn SecretStore,
    owner: &OwnerReference,
    requested: SecureValues,
    prev: Option<&SecureValues>,
    outcome: &mut SecureValueOutcome,
) -> StorageResult<SecureValues> {
    let previous_name = |k: &str| prev.and_then(|p| p.get(k)).map(|v| v.name.clone()).filter(|n| !n.is_empty());
    let mut resolved = SecureValues::new();
    let mut deletes: BTreeSet<String> = BTreeSet::new();

    for (key, entry) in requested.iter() {
        let SecureValue { name, create, remove } = entry;
        if !name.is_empty() {
            if create.is_some() || *remove {
                return Err(StorageError::InvalidState(format!(
                    "secure value {:?}: name cannot be combined with create or remove",
                    key
                )));
            }
            if let Some(old) = previous_name(key) {
                if &old != name {
                    deletes.insert(old);
                }
            }
            resolved.insert(key.clone(), SecureValue::named(name.clone()));
        } else if *remove {
            if create.is_some() {
                return Err(StorageError::InvalidState(format!("secure value {:?}: create and remove are exclusive", key)));
            }
            match previous_name(key) {
                Some(old) => {
                    deletes.insert(old);
                }
                None => {
                    return Err(StorageError::InvalidState(format!(
                        "secure value {:?}: cannot remove a value that does not exist",
                        key
                    )))
                }
            }
        } else if let Some(raw) = create {
            let created = ctx.guard(store.create_inline(owner, raw)).await?;
            counter!("secure_values_created_total", 1u64);
            outcome.created.push(created.clone());
            if let Some(old) = previous_name(key) {
                deletes.insert(old);
            }
            resolved.insert(key.clone(), SecureValue::named(created));
        } else {
            return Err(StorageError::InvalidState(format!(
                "secure value {:?}: expected name, create or remove",
                key
            )));
        }
    }

    if let Some(prev) = prev {
        for (key, entry) in prev.iter() {
            if !requested.contains_key(key) && !entry.name.is_empty() {
                resolved.insert(key.clone(), entry.clone());
            }
        }
    }

    let still_used: BTreeSet<&str> = resolved.values().map(|v| v.name.as_str()).collect();
    outcome.pending_deletes = deletes.into_iter().filter(|n| !still_used.contains(n.as_str())).collect();
    Ok(resolved)
}

/// On resource deletion: delete every referenced secret and clear the map.
/// All deletions are attempted; the first failure is returned.
pub async fn handle_secure_values_delete(
    ctx: &RequestContext,
    store: &dyn SecretStore,
    owner: &OwnerReference,
    meta: &mut ObjectMeta,
) -> StorageResult<()> {
    let Some(values) = meta.secure_values.take() else {
        return Ok(());
    };
    let mut first_err: Option<StorageError> = None;
    for (key, entry) in values.iter() {
        if entry.name.is_empty() {
            continue;
        }
        match ctx.guard(store.delete_when_owned_by_resource(owner, &entry.name)).await {
            Ok(()) => counter!("secure_values_deleted_total", 1u64),
            Err(e) => {
                warn!(owner = %owner.name, key = %key, name = %entry.name, error = %e, "secure values: delete on resource removal failed");
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Convenience wrapper binding the coordinator functions to one secret store.
#[derive(Clone)]
pub struct SecureValueCoordinator {
    store: Arc<dyn SecretStore>,
}

impl SecureValueCoordinator {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    pub async fn prepare(
        &self,
        ctx: &RequestContext,
        owner: &OwnerReference,
        new_meta: &mut ObjectMeta,
        previous: Option<&ObjectMeta>,
    ) -> StorageResult<SecureValueOutcome> {
        prepare_secure_values(ctx, self.store.as_ref(), owner, new_meta, previous).await
    }

    pub async fn finish(&self, ctx: &RequestContext, outcome: SecureValueOutcome, write_err: Option<StorageError>) -> StorageResult<()> {
        outcome.finish(ctx, write_err, self.store.as_ref()).await
    }

    pub async fn handle_delete(&self, ctx: &RequestContext, owner: &OwnerReference, meta: &mut ObjectMeta) -> StorageResult<()> {
        handle_secure_values_delete(ctx, self.store.as_ref(), owner, meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use strata_core::BackendError;

    #[derive(Default)]
    struct Recorder {
        next: Mutex<u32>,
        created: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        fail_create_after: Option<u32>,
    }

    #[async_trait::async_trait]
    impl SecretStore for Recorder {
        async fn create_inline(&self, _owner: &OwnerReference, raw: &str) -> Result<String, BackendError> {
            let mut n = self.next.lock().unwrap();
            if let Some(limit) = self.fail_create_after {
                if *n >= limit {
                    return Err(BackendError::Unavailable("secret store down".into()));
                }
            }
            *n += 1;
            let name = format!("sv-{}-{}", *n, raw.len());
            self.created.lock().unwrap().push(name.clone());
            Ok(name)
        }

        async fn delete_when_owned_by_resource(&self, _owner: &OwnerReference, name: &str) -> Result<(), BackendError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn owner() -> OwnerReference {
        OwnerReference { group: "g".into(), resource: "r".into(), namespace: "ns".into(), name: "obj".into(), uid: "u1".into() }
    }

    fn meta(pairs: &[(&str, SecureValue)]) -> ObjectMeta {
        let mut m = ObjectMeta::default();
        if !pairs.is_empty() {
            m.secure_values = Some(pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect());
        }
        m
    }

    #[tokio::test]
    async fn remove_queues_delete_until_finish() {
        let store = Recorder::default();
        let ctx = RequestContext::background();
        let prev = meta(&[("a", SecureValue::named("X"))]);
        let mut next = meta(&[("a", SecureValue::remove())]);
        let outcome = prepare_secure_values(&ctx, &store, &owner(), &mut next, Some(&prev)).await.unwrap();
        assert!(next.secure_values.is_none());
        assert_eq!(outcome.pending_deletes, vec!["X".to_string()]);
        assert!(store.deleted.lock().unwrap().is_empty());

        outcome.finish(&ctx, None, &store).await.unwrap();
        assert_eq!(*store.deleted.lock().unwrap(), vec!["X".to_string()]);
    }

    #[tokio::test]
    async fn failed_write_deletes_nothing_and_returns_error() {
        let store = Recorder::default();
        let ctx = RequestContext::background();
        let prev = meta(&[("a", SecureValue::named("X"))]);
        let mut next = meta(&[("a", SecureValue::remove())]);
        let outcome = prepare_secure_values(&ctx, &store, &owner(), &mut next, Some(&prev)).await.unwrap();
        let err = outcome
            .finish(&ctx, Some(StorageError::Conflict("lost race".into())), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(ref m) if m == "lost race"));
        assert!(store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_materializes_and_rotates() {
        let store = Recorder::default();
        let ctx = RequestContext::background();
        let prev = meta(&[("token", SecureValue::named("old")), ("kept", SecureValue::named("K"))]);
        let mut next = meta(&[("token", SecureValue::create("s3cr3t"))]);
        let outcome = prepare_secure_values(&ctx, &store, &owner(), &mut next, Some(&prev)).await.unwrap();
        let map = next.secure_values.clone().unwrap();
        let created = store.created.lock().unwrap()[0].clone();
        assert_eq!(map["token"], SecureValue::named(created.clone()));
        assert_eq!(map["kept"], SecureValue::named("K"), "omitted entries carry forward");
        assert!(map.values().all(|v| v.create.is_none() && !v.remove));
        assert_eq!(outcome.created, vec![created]);
        assert_eq!(outcome.pending_deletes, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn renamed_reference_queues_old_name_unless_still_used() {
        let store = Recorder::default();
        let ctx = RequestContext::background();
        let prev = meta(&[("a", SecureValue::named("A")), ("b", SecureValue::named("B"))]);
        // a now points at B (still used by b), b now points at C
        let mut next = meta(&[("a", SecureValue::named("B")), ("b", SecureValue::named("C"))]);
        let outcome = prepare_secure_values(&ctx, &store, &owner(), &mut next, Some(&prev)).await.unwrap();
        assert_eq!(outcome.pending_deletes, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn invalid_entries_are_rejected() {
        let store = Recorder::default();
        let ctx = RequestContext::background();
        let mut empty_entry = meta(&[("a", SecureValue::default())]);
        let err = prepare_secure_values(&ctx, &store, &owner(), &mut empty_entry, None).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidState(_)));

        let mut remove_missing = meta(&[("a", SecureValue::remove())]);
        let err = prepare_secure_values(&ctx, &store, &owner(), &mut remove_missing, None).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidState(_)));

        let mut mixed = meta(&[("a", SecureValue { name: "n".into(), create: Some("x".into()), remove: false })]);
        let err = prepare_secure_values(&ctx, &store, &owner(), &mut mixed, None).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidState(_)));
    }

    #[tokio::test]
    async fn no_values_anywhere_is_noop() {
        let store = Recorder::default();
        let mut next = ObjectMeta::default();
        let outcome = prepare_secure_values(&RequestContext::background(), &store, &owner(), &mut next, Some(&ObjectMeta::default()))
            .await
            .unwrap();
        assert!(outcome.is_noop());
        assert!(next.secure_values.is_none());
    }

    #[tokio::test]
    async fn failed_create_rolls_back_earlier_creates() {
        let store = Recorder { fail_create_after: Some(1), ..Default::default() };
        let ctx = RequestContext::background();
        let mut next = meta(&[("a", SecureValue::create("one")), ("b", SecureValue::create("two"))]);
        let err = prepare_secure_values(&ctx, &store, &owner(), &mut next, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Transport(_)));
        let created = store.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(*store.deleted.lock().unwrap(), created);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_created_secrets() {
        let store = Recorder::default();
        let ctx = RequestContext::background();
        let mut next = meta(&[("a", SecureValue::create("one"))]);
        let outcome = prepare_secure_values(&ctx, &store, &owner(), &mut next, None).await.unwrap();
        let _ = outcome.finish(&ctx, Some(StorageError::Internal("boom".into())), &store).await;
        assert_eq!(*store.deleted.lock().unwrap(), *store.created.lock().unwrap());
    }

    #[tokio::test]
    async fn delete_clears_every_reference() {
        let store = Recorder::default();
        let coordinator = SecureValueCoordinator::new(Arc::new(Recorder::default()));
        let ctx = RequestContext::background();
        let mut m = meta(&[("a", SecureValue::named("A")), ("b", SecureValue::named("B"))]);
        handle_secure_values_delete(&ctx, &store, &owner(), &mut m).await.unwrap();
        assert!(m.secure_values.is_none());
        assert_eq!(*store.deleted.lock().unwrap(), vec!["A".to_string(), "B".to_string()]);

        let mut none = ObjectMeta::default();
        coordinator.handle_delete(&ctx, &owner(), &mut none).await.unwrap();
    }
}
