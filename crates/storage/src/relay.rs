//! Remote event source: feed the broadcaster from the backend's change stream
//! instead of the local write path.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use strata_core::{
    decode, BackendEvent, BackendEventKind, GroupResource, ListRequest, Object, ResourceClient, ResourceKey, ResourceVersion,
    StorageError, StorageResult, WatchRequest,
};
use strata_watch::{Change, ChangeKind, WatchBroadcaster};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) fn to_change<T: Object>(ev: BackendEvent) -> StorageResult<Change<T>> {
    let rv = ev.resource_version;
    let previous = ev.previous.as_deref().map(|p| decode::<T>(p, 0)).transpose()?;
    match ev.kind {
        BackendEventKind::Added => Change::added(ev.key, decode(&ev.value, rv)?),
        BackendEventKind::Modified => Change::new(ChangeKind::Modified, ev.key, decode(&ev.value, rv)?, previous),
        BackendEventKind::Deleted => {
            let last = match (ev.value.is_empty(), previous) {
                (false, _) => decode(&ev.value, rv)?,
                (true, Some(mut p)) => {
                    p.set_resource_version(rv);
                    p
                }
                (true, None) => return Err(StorageError::Internal(format!("delete event for {} has no payload", ev.key))),
            };
            Change::deleted(ev.key, last)
        }
    }
}

/// Relay backend events into `broadcaster` until `shutdown` fires.
///
/// A failed or ended stream terminates current subscriptions with an error
/// and is re-established after the last relayed event.
pub(crate) async fn run<T: Object>(
    client: Arc<dyn ResourceClient>,
    group_resource: GroupResource,
    broadcaster: WatchBroadcaster<T>,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    let scope = ResourceKey::new(&group_resource, "", "");
    // Last RV handed to the broadcaster. Not the high watermark: writes and lists move that too.
    let mut resume_from: Option<ResourceVersion> = None;
    info!(gr = %group_resource, "relay: starting");
    while !shutdown.is_cancelled() {
        let since = match resume_from {
            Some(rv) => rv,
            None => {
                let req = ListRequest { key: scope.clone(), limit: 1, ..Default::default() };
                let res = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    res = client.list(req) => res,
                };
                match res {
                    Ok(resp) => resp.resource_version,
                    Err(e) => {
                        warn!(gr = %group_resource, error = %e, "relay: cannot determine starting resource version");
                        if pause(backoff, &shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }
        };
        if resume_from.is_none() {
            // Changes at or below `since` are never relayed.
            broadcaster.raise_floor(since);
        }
        resume_from = Some(since);
        broadcaster.observe(since);

        let stream = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = client.watch(WatchRequest { key: scope.clone(), since }) => res,
        };
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(gr = %group_resource, since, error = %e, "relay: backend watch failed");
                broadcaster.broadcast_error(e.into()).await;
                if pause(backoff, &shutdown).await {
                    break;
                }
                continue;
            }
        };
        debug!(gr = %group_resource, since, "relay: streaming");

        let ended = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break None,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(ev)) => {
                    counter!("relay_events_total", 1u64);
                    resume_from = Some(ev.resource_version);
                    match to_change::<T>(ev) {
                        Ok(change) => broadcaster.notify(change).await,
                        Err(e) => {
                            counter!("relay_decode_errors_total", 1u64);
                            warn!(gr = %group_resource, error = %e, "relay: dropping undecodable event");
                        }
                    }
                }
                Some(Err(e)) => break Some(StorageError::from(e)),
                None => break Some(StorageError::Internal("backend watch stream ended".into())),
            }
        };
        match ended {
            None => break,
            Some(err) => {
                counter!("relay_restarts_total", 1u64);
                warn!(gr = %group_resource, error = %err, resume_from = ?resume_from, "relay: stream interrupted");
                broadcaster.broadcast_error(err).await;
                if pause(backoff, &shutdown).await {
                    break;
                }
            }
        }
    }
    info!(gr = %group_resource, "relay: stopped");
}

/// Sleep for `backoff`; true when shutdown fired first.
async fn pause(backoff: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}
