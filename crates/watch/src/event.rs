use serde_json::Value as Json;
use strata_core::{Object, ResourceKey, ResourceVersion, StorageError, StorageResult};
use strata_select::Predicate;

/// What a subscriber receives.
#[derive(Debug)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Progress marker; `initial_events_end` flags the end of the initial listing.
    Bookmark { resource_version: ResourceVersion, initial_events_end: bool },
    /// Terminal: nothing follows on this watcher.
    Error(StorageError),
}

impl<T: Object> WatchEvent<T> {
    pub fn type_name(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
            WatchEvent::Bookmark { .. } => "BOOKMARK",
            WatchEvent::Error(_) => "ERROR",
        }
    }

    pub fn object(&self) -> Option<&T> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            _ => None,
        }
    }

    /// RV carried by the event; 0 for errors or objects without one.
    pub fn resource_version(&self) -> ResourceVersion {
        match self {
            WatchEvent::Bookmark { resource_version, .. } => *resource_version,
            WatchEvent::Error(_) => 0,
            other => other.object().and_then(|o| o.resource_version().ok()).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// A typed object alongside its JSON rendering, so predicates are evaluated
/// once per change instead of once per subscriber.
#[derive(Debug, Clone)]
pub struct ObjectState<T> {
    pub object: T,
    pub value: Json,
}

impl<T: Object> ObjectState<T> {
    pub fn new(object: T) -> StorageResult<Self> {
        let value = serde_json::to_value(&object)?;
        Ok(Self { object, value })
    }
}

/// One committed write as seen by the broadcaster.
///
/// For `Deleted`, `current` is the last stored state stamped with the
/// deletion RV.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub kind: ChangeKind,
    pub key: ResourceKey,
    pub resource_version: ResourceVersion,
    pub current: ObjectState<T>,
    pub previous: Option<ObjectState<T>>,
}

impl<T: Object> Change<T> {
    pub fn new(kind: ChangeKind, key: ResourceKey, current: T, previous: Option<T>) -> StorageResult<Self> {
        let resource_version = current.resource_version()?;
        Ok(Self {
            kind,
            key,
            resource_version,
            current: ObjectState::new(current)?,
            previous: previous.map(ObjectState::new).transpose()?,
        })
    }

    pub fn added(key: ResourceKey, current: T) -> StorageResult<Self> {
        Self::new(ChangeKind::Added, key, current, None)
    }

    pub fn modified(key: ResourceKey, current: T, previous: T) -> StorageResult<Self> {
        Self::new(ChangeKind::Modified, key, current, Some(previous))
    }

    pub fn deleted(key: ResourceKey, last: T) -> StorageResult<Self> {
        Self::new(ChangeKind::Deleted, key, last, None)
    }
}

/// What one subscription should see for `change`, if anything.
///
/// A `Modified` change is reclassified by predicate membership: entering the
/// selection is `Added`, leaving it is `Deleted` carrying the previous
/// payload stamped with the new RV.
pub fn classify<T: Object>(
    change: &Change<T>,
    watermark: ResourceVersion,
    scope: &ResourceKey,
    predicate: &Predicate,
) -> Option<WatchEvent<T>> {
    if change.resource_version <= watermark || !scope.contains(&change.key) {
        return None;
    }
    let current_ok = predicate.matches_value(&change.current.value);
    match change.kind {
        ChangeKind::Added => current_ok.then(|| WatchEvent::Added(change.current.object.clone())),
        ChangeKind::Deleted => current_ok.then(|| WatchEvent::Deleted(change.current.object.clone())),
        ChangeKind::Modified => {
            let previous_ok = match change.previous.as_ref() {
                Some(p) => predicate.matches_value(&p.value),
                None => current_ok,
            };
            match (current_ok, previous_ok) {
                (true, true) => Some(WatchEvent::Modified(change.current.object.clone())),
                (true, false) => Some(WatchEvent::Added(change.current.object.clone())),
                (false, true) => {
                    let mut old = match change.previous.as_ref() {
                        Some(p) => p.object.clone(),
                        None => change.current.object.clone(),
                    };
                    old.set_resource_version(change.resource_version);
                    Some(WatchEvent::Deleted(old))
                }
                (false, false) => None,
            }
        }
    }
}
