//! Strata storage engine: versioned CRUD, paginated lists and filtered watches
//! for one group/resource, layered over a remote [`ResourceClient`].
//!
//! The engine stamps server-owned metadata, materializes secure values,
//! offloads oversized specs to a blob store and broadcasts every committed
//! write to watchers. In-memory collaborators live in [`memory`].
//!
//! [`ResourceClient`]: strata_core::ResourceClient

#![forbid(unsafe_code)]

mod config;
mod engine;
pub mod memory;
mod options;
mod relay;

pub use config::{EngineConfig, EventSource};
pub use engine::{EngineBuilder, StorageEngine, ValidateDeletion, MAX_UPDATE_ATTEMPTS};
pub use options::{GetOptions, ListOptions, ObjectList, Preconditions, WatchOptions};

pub use strata_core::{
    GroupResource, Object, ObjectMeta, RequestContext, ResourceKey, ResourceVersion, StorageError, StorageResult, VersionMatch,
};
pub use strata_select::Predicate;
pub use strata_watch::{BroadcasterConfig, WatchEvent, Watcher};
