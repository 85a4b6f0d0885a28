//! In-memory snapshot storage.
//!
//! Used wherever a real storage layer would be overkill. It counts
//! every region opened and closed and every lease taken and
//! released, and can be told to fail a specific open, so callers can
//! check that nothing leaks on any exit path.

use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Cursor;
use std::io::Read;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use super::HandleLease;
use super::SnapshotStorage;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::model::*;

/// Open and release counters of an [`InMemStorage`].
#[derive(Debug, Default)]
pub struct StorageStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    retained: AtomicUsize,
    released: AtomicUsize,
}

impl StorageStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn retained(&self) -> usize {
        self.retained.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Regions opened but not yet closed.
    pub fn open_streams(&self) -> usize {
        self.opened() - self.closed()
    }

    /// Leases taken but not yet released.
    pub fn live_leases(&self) -> usize {
        self.retained() - self.released()
    }
}

/// Reader that reports its own drop.
struct CountedReader {
    inner: Cursor<Vec<u8>>,
    stats: Arc<StorageStats>,
}

impl Read for CountedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for CountedReader {
    fn drop(&mut self) {
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A snapshot store with all data in memory.
#[derive(Debug, Default)]
pub struct InMemStorage {
    regions: Mutex<HashMap<RegionRef, Vec<u8>>>,
    handles: Mutex<HashSet<HandleId>>,
    stats: Arc<StorageStats>,
    open_attempts: AtomicUsize,
    /// 1-based open attempt to fail; 0 for never.
    fail_open_at: AtomicUsize,
}

impl InMemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<StorageStats> {
        self.stats.clone()
    }

    /// Make the `n`th call to [`SnapshotStorage::open_region`],
    /// counting from 1 and from now, fail with
    /// [`StateError::ResourceExhausted`].
    pub fn fail_open_at(&self, n: usize) {
        self.open_attempts.store(0, Ordering::SeqCst);
        self.fail_open_at.store(n, Ordering::SeqCst);
    }

    pub fn insert_region(&self, region: RegionRef, bytes: Vec<u8>) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(region.handle.clone());
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(region, bytes);
    }

    /// Store an operator-scoped handle's payload.
    pub fn insert_operator(
        &self,
        handle: &StateHandle,
        snap: &OperatorSnapshot,
    ) -> StateResult<()> {
        self.insert_region(handle.region(), encode(snap)?);
        Ok(())
    }

    /// Store one key group of a keyed handle.
    pub fn insert_key_group(
        &self,
        handle: &StateHandle,
        snap: &KeyGroupSnapshot,
    ) -> StateResult<()> {
        self.insert_region(handle.key_group_region(snap.key_group), encode(snap)?);
        Ok(())
    }
}

impl SnapshotStorage for InMemStorage {
    fn open_region(&self, region: &RegionRef) -> StateResult<Box<dyn Read + Send>> {
        let attempt = self.open_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_open_at.load(Ordering::SeqCst) {
            return Err(StateError::exhausted(&format!(
                "injected failure opening region {region}"
            )));
        }

        let bytes = self
            .regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(region)
            .cloned()
            .ok_or_else(|| StateError::exhausted(&format!("no region {region} in storage")))?;

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("Opened in-memory region {region}");
        Ok(Box::new(CountedReader {
            inner: Cursor::new(bytes),
            stats: self.stats.clone(),
        }))
    }

    fn retain(&self, handle: &HandleId) -> StateResult<HandleLease> {
        if !self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(handle)
        {
            return Err(StateError::restore_failure(&format!(
                "handle {handle} is missing from storage"
            )));
        }

        self.stats.retained.fetch_add(1, Ordering::SeqCst);
        let stats = self.stats.clone();
        Ok(HandleLease::with_release(handle.clone(), move |_handle| {
            stats.released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[test]
fn open_and_drop_are_counted() {
    let store = InMemStorage::new();
    let region = RegionRef {
        handle: HandleId("h".to_owned()),
        key_group: None,
    };
    store.insert_region(region.clone(), b"abc".to_vec());

    let mut reader = store.open_region(&region).unwrap();
    let mut buf = String::new();
    reader.read_to_string(&mut buf).unwrap();
    assert_eq!(buf, "abc");
    assert_eq!(store.stats().open_streams(), 1);

    drop(reader);
    assert_eq!(store.stats().opened(), 1);
    assert_eq!(store.stats().open_streams(), 0);
}

#[test]
fn fail_open_at_fails_only_that_attempt() {
    let store = InMemStorage::new();
    let region = RegionRef {
        handle: HandleId("h".to_owned()),
        key_group: None,
    };
    store.insert_region(region.clone(), Vec::new());
    store.fail_open_at(2);

    assert!(store.open_region(&region).is_ok());
    let err = store.open_region(&region).err().unwrap();
    assert!(matches!(err, StateError::ResourceExhausted { .. }));
    assert!(store.open_region(&region).is_ok());
    assert_eq!(store.stats().open_streams(), 0);
}

#[test]
fn leases_release_on_drop() {
    let store = InMemStorage::new();
    let handle = HandleId("h".to_owned());
    store.insert_region(
        RegionRef {
            handle: handle.clone(),
            key_group: None,
        },
        Vec::new(),
    );

    let lease = store.retain(&handle).unwrap();
    assert_eq!(store.stats().live_leases(), 1);
    drop(lease);
    assert_eq!(store.stats().live_leases(), 0);

    let err = store.retain(&HandleId("missing".to_owned())).unwrap_err();
    assert!(matches!(err, StateError::RestoreFailure { .. }));
}
