mod common;

use std::time::Duration;

use common::*;
use strata_storage::memory::MemoryResourceClient;
use strata_storage::{
    EngineConfig, GetOptions, GroupResource, Object, Preconditions, RequestContext, ResourceKey, StorageError, WatchOptions,
    MAX_UPDATE_ATTEMPTS,
};

#[tokio::test]
async fn create_then_get_round_trips() {
    let h = harness();
    let ctx = RequestContext::background().with_user("alice");
    let mut input = pod("a", "A");
    input.metadata.labels.insert("app".into(), "web".into());

    let created = h.engine.create(&ctx, &key("ns", "a"), input.clone(), None).await.unwrap();
    assert!(created.resource_version().unwrap() > 0);
    assert!(!created.metadata.uid.is_empty());
    assert_eq!(created.metadata.namespace, "ns");
    assert_eq!(created.metadata.generation, 1);
    assert_eq!(created.metadata.created_by, "alice");
    assert!(created.metadata.creation_timestamp.is_some());
    assert_eq!(created.metadata.labels, input.metadata.labels);
    assert_eq!(created.spec, input.spec);

    let got = h.engine.get(&ctx, &key("ns", "a"), &GetOptions::default()).await.unwrap();
    assert_eq!(got, created);
}

#[tokio::test]
async fn create_on_existing_key_leaves_object_alone() {
    let h = harness();
    let ctx = RequestContext::background();
    let first = h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap();
    let err = h.engine.create(&ctx, &key("ns", "a"), pod("a", "B"), None).await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists(_)));
    let got = h.engine.get(&ctx, &key("ns", "a"), &GetOptions::default()).await.unwrap();
    assert_eq!(got, first);
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let h = harness();
    let ctx = RequestContext::background();

    let mut versioned = pod("a", "A");
    versioned.metadata.resource_version = "5".into();
    let err = h.engine.create(&ctx, &key("ns", "a"), versioned, None).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRequest(_)));

    let foreign = ResourceKey::new(&GroupResource::new("other.io", "things"), "ns", "a");
    let err = h.engine.create(&ctx, &foreign, pod("a", "A"), None).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRequest(_)));

    let err = h.engine.create(&ctx, &key("ns", "a"), pod("b", "A"), None).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRequest(_)));
    assert_eq!(h.client.write_count(), 0);
}

#[tokio::test]
async fn get_honours_minimum_resource_version() {
    let h = harness();
    let ctx = RequestContext::background();
    let created = h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap();
    let rv = created.resource_version().unwrap();

    let opts = GetOptions { resource_version: rv.to_string(), ..Default::default() };
    assert_eq!(h.engine.get(&ctx, &key("ns", "a"), &opts).await.unwrap(), created);

    let opts = GetOptions { resource_version: (rv + 10).to_string(), ..Default::default() };
    match h.engine.get(&ctx, &key("ns", "a"), &opts).await.unwrap_err() {
        StorageError::TooLargeResourceVersion { requested, actual } => {
            assert_eq!(requested, rv + 10);
            assert_eq!(actual, rv);
        }
        other => panic!("unexpected {other:?}"),
    }

    let opts = GetOptions { resource_version: "abc".into(), ..Default::default() };
    assert!(matches!(h.engine.get(&ctx, &key("ns", "a"), &opts).await, Err(StorageError::InvalidRequest(_))));
}

#[tokio::test]
async fn get_missing_object() {
    let h = harness();
    let ctx = RequestContext::background();
    let err = h.engine.get(&ctx, &key("ns", "nope"), &GetOptions::default()).await.unwrap_err();
    assert!(err.is_not_found());
    let opts = GetOptions { ignore_not_found: true, ..Default::default() };
    assert_eq!(h.engine.get(&ctx, &key("ns", "nope"), &opts).await.unwrap(), Pod::default());
}

#[tokio::test]
async fn cancelled_context_aborts_reads() {
    let h = harness();
    let ctx = RequestContext::background();
    ctx.cancel();
    let res = h.engine.get(&ctx, &key("ns", "a"), &GetOptions::default()).await;
    assert!(matches!(res, Err(StorageError::Cancelled)));
}

#[tokio::test]
async fn unchanged_update_is_a_noop() {
    let h = harness();
    let ctx = RequestContext::background();
    let created = h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap();
    let rv = created.resource_version().unwrap();
    let opts = WatchOptions { resource_version: rv.to_string(), ..Default::default() };
    let mut w = h.engine.watch(&ctx, &key("ns", ""), &opts).await.unwrap();
    let writes = h.client.write_count();

    let out = h
        .engine
        .guaranteed_update(&ctx, &key("ns", "a"), false, &Preconditions::none(), Ok, None)
        .await
        .unwrap();
    assert_eq!(out.resource_version().unwrap(), rv);
    assert_eq!(h.client.write_count(), writes);
    assert!(quiet(&mut w).await);
}

#[tokio::test]
async fn update_preserves_identity_and_bumps_generation() {
    let h = harness();
    let created = h
        .engine
        .create(&RequestContext::background().with_user("alice"), &key("ns", "a"), pod("a", "A"), None)
        .await
        .unwrap();
    let ctx = RequestContext::background().with_user("bob");
    let out = h
        .engine
        .guaranteed_update(
            &ctx,
            &key("ns", "a"),
            false,
            &Preconditions::uid(created.metadata.uid.clone()),
            |mut p: Pod| {
                p.spec.title = "B".into();
                p.metadata.uid = "forged".into();
                Ok(p)
            },
            None,
        )
        .await
        .unwrap();
    assert!(out.resource_version().unwrap() > created.resource_version().unwrap());
    assert_eq!(out.spec.title, "B");
    assert_eq!(out.metadata.uid, created.metadata.uid);
    assert_eq!(out.metadata.creation_timestamp, created.metadata.creation_timestamp);
    assert_eq!(out.metadata.created_by, "alice");
    assert_eq!(out.metadata.updated_by, "bob");
    assert!(out.metadata.updated_timestamp.is_some());
    assert_eq!(out.metadata.generation, 2);
}

#[tokio::test]
async fn failing_precondition_gives_up_after_max_attempts() {
    let h = harness();
    let ctx = RequestContext::background();
    h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap();
    let reads = h.client.read_count();

    let err = h
        .engine
        .guaranteed_update(&ctx, &key("ns", "a"), false, &Preconditions::uid("someone-else"), Ok, None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.client.read_count() - reads, MAX_UPDATE_ATTEMPTS as usize);
    assert_eq!(MAX_UPDATE_ATTEMPTS, 30);
}

#[tokio::test]
async fn update_function_error_is_returned_after_max_attempts() {
    let h = harness();
    let ctx = RequestContext::background();
    h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap();
    let mut calls = 0u32;
    let err = h
        .engine
        .guaranteed_update(
            &ctx,
            &key("ns", "a"),
            false,
            &Preconditions::none(),
            |_p: Pod| {
                calls += 1;
                Err(StorageError::InvalidRequest("title is immutable".into()))
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRequest(m) if m == "title is immutable"));
    assert_eq!(calls, MAX_UPDATE_ATTEMPTS);
}

#[tokio::test]
async fn update_of_missing_object() {
    let h = harness();
    let ctx = RequestContext::background().with_user("carol");
    let set_title = |mut p: Pod| {
        p.spec.title = "new".into();
        Ok(p)
    };
    let err = h
        .engine
        .guaranteed_update(&ctx, &key("ns", "a"), false, &Preconditions::none(), set_title, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let created = h
        .engine
        .guaranteed_update(&ctx, &key("ns", "a"), true, &Preconditions::none(), set_title, None)
        .await
        .unwrap();
    assert_eq!(created.metadata.name, "a");
    assert_eq!(created.metadata.namespace, "ns");
    assert_eq!(created.metadata.generation, 1);
    assert_eq!(created.metadata.created_by, "carol");
    assert_eq!(created.spec.title, "new");
}

#[tokio::test]
async fn stale_cached_object_is_refreshed() {
    let h = harness();
    let ctx = RequestContext::background();
    let stale = h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap();
    h.engine
        .guaranteed_update(
            &ctx,
            &key("ns", "a"),
            false,
            &Preconditions::none(),
            |mut p: Pod| {
                p.spec.title = "B".into();
                Ok(p)
            },
            None,
        )
        .await
        .unwrap();
    let reads = h.client.read_count();

    let out = h
        .engine
        .guaranteed_update(
            &ctx,
            &key("ns", "a"),
            false,
            &Preconditions::none(),
            |mut p: Pod| {
                p.spec.title.push('!');
                Ok(p)
            },
            Some(stale),
        )
        .await
        .unwrap();
    // The cached attempt loses the CAS; the retry reads "B".
    assert_eq!(out.spec.title, "B!");
    assert_eq!(h.client.read_count() - reads, 1);
}

#[tokio::test]
async fn delete_checks_preconditions_with_one_refresh() {
    let h = harness();
    let ctx = RequestContext::background();
    let created = h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap();
    let reads = h.client.read_count();

    let err = h
        .engine
        .delete(&ctx, &key("ns", "a"), &Preconditions::resource_version("1234"), None, None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.client.read_count() - reads, 2);

    let refuse = |_: &Pod| -> Result<(), StorageError> { Err(StorageError::InvalidRequest("protected".into())) };
    let err = h.engine.delete(&ctx, &key("ns", "a"), &Preconditions::none(), Some(&refuse), None).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRequest(_)));
    assert!(h.client.raw(&key("ns", "a")).is_some());

    let rv = created.resource_version().unwrap();
    let deleted = h
        .engine
        .delete(&ctx, &key("ns", "a"), &Preconditions::resource_version(rv.to_string()), None, None)
        .await
        .unwrap();
    assert!(deleted.resource_version().unwrap() > rv);
    assert_eq!(deleted.metadata.uid, created.metadata.uid);
    assert!(h.client.raw(&key("ns", "a")).is_none());
}

#[tokio::test]
async fn delete_with_stale_cache_refreshes() {
    let h = harness();
    let ctx = RequestContext::background();
    let stale = h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap();
    h.engine
        .guaranteed_update(
            &ctx,
            &key("ns", "a"),
            false,
            &Preconditions::none(),
            |mut p: Pod| {
                p.spec.title = "B".into();
                Ok(p)
            },
            None,
        )
        .await
        .unwrap();

    let deleted = h
        .engine
        .delete(&ctx, &key("ns", "a"), &Preconditions::uid(stale.metadata.uid.clone()), None, Some(stale))
        .await
        .unwrap();
    assert_eq!(deleted.spec.title, "B");

    let err = h.engine.delete(&ctx, &key("ns", "a"), &Preconditions::none(), None, None).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn unchanged_stale_cached_object_is_reread() {
    let h = harness();
    let ctx = RequestContext::background();
    let stale = h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap();
    let current = h
        .engine
        .guaranteed_update(
            &ctx,
            &key("ns", "a"),
            false,
            &Preconditions::none(),
            |mut p: Pod| {
                p.spec.title = "B".into();
                Ok(p)
            },
            None,
        )
        .await
        .unwrap();
    let reads = h.client.read_count();
    let writes = h.client.write_count();

    let out = h
        .engine
        .guaranteed_update(&ctx, &key("ns", "a"), false, &Preconditions::none(), Ok, Some(stale))
        .await
        .unwrap();
    assert_eq!(out.spec.title, "B");
    assert_eq!(out.metadata.resource_version, current.metadata.resource_version);
    assert_eq!(h.client.read_count(), reads + 1);
    assert_eq!(h.client.write_count(), writes);
}

#[tokio::test]
async fn ttl_removes_object_once_expired() {
    let h = harness();
    let ctx = RequestContext::background();
    h.engine
        .create(&ctx, &key("ns", "a"), pod("a", "A"), Some(Duration::from_millis(50)))
        .await
        .unwrap();

    let gone = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if h.client.raw(&key("ns", "a")).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "ttl delete did not happen");
}

#[tokio::test]
async fn ttl_spares_a_recreated_object() {
    let h = harness();
    let ctx = RequestContext::background();
    let first = h
        .engine
        .create(&ctx, &key("ns", "a"), pod("a", "A"), Some(Duration::from_millis(150)))
        .await
        .unwrap();
    h.engine.delete(&ctx, &key("ns", "a"), &Preconditions::none(), None, None).await.unwrap();
    let second = h.engine.create(&ctx, &key("ns", "a"), pod("a", "B"), None).await.unwrap();
    assert_ne!(first.metadata.uid, second.metadata.uid);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let got = h.engine.get(&ctx, &key("ns", "a"), &GetOptions::default()).await.unwrap();
    assert_eq!(got, second);
}

#[tokio::test]
async fn shutdown_refuses_further_work() {
    let h = harness_with(MemoryResourceClient::new(), EngineConfig::default(), None);
    let ctx = RequestContext::background();
    assert!(h.engine.readiness_check().is_ok());
    h.engine.shutdown().await;
    assert!(matches!(h.engine.readiness_check(), Err(StorageError::InvalidState(_))));
    let err = h.engine.create(&ctx, &key("ns", "a"), pod("a", "A"), None).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidState(_)));
}
