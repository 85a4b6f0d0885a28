//! Implementations of snapshot storage.
//!
//! Storage is modeled as a read-only map from [`RegionRef`] to bytes,
//! plus a way to pin a handle while a backend restored from it is
//! alive. There are two implementations:
//! [`sqlite::SqliteSnapshotStorage`] over a directory of SQLite
//! partition files, and [`in_mem::InMemStorage`] which keeps
//! everything in memory and counts what is opened and released.

use std::fmt::Debug;
use std::io::Read;

use crate::errors::StateResult;
use crate::model::HandleId;
use crate::model::RegionRef;

pub mod in_mem;
pub mod sqlite;

pub use in_mem::InMemStorage;
pub use in_mem::StorageStats;
pub use sqlite::SqlitePartition;
pub use sqlite::SqliteSnapshotStorage;
pub use sqlite::StorageConfig;

/// All snapshot stores have to implement this.
pub trait SnapshotStorage: Send + Sync {
    /// Open a byte stream over one persisted region.
    ///
    /// Nothing is opened until this is called. Dropping the returned
    /// reader releases whatever it holds. I/O failures are
    /// [`crate::errors::StateError::ResourceExhausted`].
    fn open_region(&self, region: &RegionRef) -> StateResult<Box<dyn Read + Send>>;

    /// Pin a handle so its regions stay readable while something
    /// restored from it is alive.
    ///
    /// Unknown handles are a
    /// [`crate::errors::StateError::RestoreFailure`].
    fn retain(&self, handle: &HandleId) -> StateResult<HandleLease>;
}

type ReleaseFn = Box<dyn FnOnce(&HandleId) + Send>;

/// Keeps a handle pinned until dropped.
pub struct HandleLease {
    handle: HandleId,
    on_release: Option<ReleaseFn>,
}

impl HandleLease {
    /// A lease that needs no cleanup.
    pub fn new(handle: HandleId) -> Self {
        Self {
            handle,
            on_release: None,
        }
    }

    pub fn with_release(
        handle: HandleId,
        on_release: impl FnOnce(&HandleId) + Send + 'static,
    ) -> Self {
        Self {
            handle,
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn handle(&self) -> &HandleId {
        &self.handle
    }
}

impl Debug for HandleLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HandleLease").field(&self.handle).finish()
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            tracing::trace!("Releasing lease on {}", self.handle);
            on_release(&self.handle);
        }
    }
}
