//! Strata watch: fan committed changes out to many subscriptions, each with
//! its own resourceVersion watermark, scope and predicate.
//!
//! Writers call [`WatchBroadcaster::notify`] after a successful backend
//! write. Every subscription owns a bounded input queue and a delivery task
//! that filters, reclassifies and forwards events to the [`Watcher`] held by
//! the caller. Queues never drop: a full input queue blocks the writer until
//! the subscriber catches up or is stopped.

#![forbid(unsafe_code)]

mod broadcaster;
mod event;

pub use broadcaster::{BroadcasterConfig, SubscribeRequest, WatchBroadcaster, Watcher};
pub use event::{classify, Change, ChangeKind, ObjectState, WatchEvent};
