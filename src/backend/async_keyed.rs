//! The asynchronous keyed state backend.
//!
//! Tables are multi-versioned: every write goes through
//! [`Arc::make_mut`] on the current version, so a [`StateView`]
//! pinned for a snapshot keeps reading the version it pinned while
//! record processing carries on writing a copy.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::RwLock;
use tracing::instrument;

use super::restore_keyed;
use super::Closeable;
use super::KeyContext;
use super::KeyedBackendParams;
use super::KeyedTables;
use super::KeyedVariant;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::model::*;
use crate::storage::HandleLease;
use crate::storage::SnapshotStorage;

#[derive(Debug, Clone, Default)]
struct VersionedTables {
    version: u64,
    tables: KeyedTables,
}

/// A read-only view of one version of an async backend's tables.
#[derive(Debug, Clone)]
pub struct StateView(Arc<VersionedTables>);

impl StateView {
    pub fn version(&self) -> u64 {
        self.0.version
    }

    pub fn get(&self, state: &str, key: &StateKey) -> Option<&StateBytes> {
        self.0.tables.get(state).and_then(|table| table.get(key))
    }

    pub fn len(&self) -> usize {
        self.0.tables.values().map(|table| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AsyncKeyedStateBackend {
    params: KeyedBackendParams,
    restored: bool,
    current_key: Mutex<Option<StateKey>>,
    tables: RwLock<Arc<VersionedTables>>,
    leases: Mutex<Vec<HandleLease>>,
    closed: AtomicBool,
}

impl AsyncKeyedStateBackend {
    /// Open the backend, restoring from `handles` if there are any.
    ///
    /// Restore happens before processing starts, so it is done
    /// synchronously here even for the async variant.
    #[instrument(name = "open_async_keyed_backend", skip_all, fields(step_id = %params.step_id))]
    pub fn open(
        params: KeyedBackendParams,
        storage: &dyn SnapshotStorage,
        handles: &[StateHandle],
    ) -> StateResult<(Self, Vec<TimerEntry>)> {
        let restored = restore_keyed(&params, KeyedVariant::Async, storage, handles)?;
        let backend = Self {
            params,
            restored: !handles.is_empty(),
            current_key: Mutex::new(None),
            tables: RwLock::new(Arc::new(VersionedTables {
                version: 0,
                tables: restored.tables,
            })),
            leases: Mutex::new(restored.leases),
            closed: AtomicBool::new(false),
        };
        Ok((backend, restored.timers))
    }

    fn ensure_open(&self) -> StateResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StateError::released(&format!(
                "async keyed backend of {} is closed",
                self.params.step_id
            )))
        } else {
            Ok(())
        }
    }

    pub fn key_serializer(&self) -> &KeySerializer {
        &self.params.key_serializer
    }

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.params.key_groups
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// Set the key of the record being processed. Timers registered
    /// through the paired timer manager are scoped to it.
    pub fn set_current_key(&self, key: StateKey) -> StateResult<()> {
        self.ensure_open()?;
        self.params.check_key(&key)?;
        *self
            .current_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(key);
        Ok(())
    }

    pub async fn get(&self, state: &str, key: &StateKey) -> StateResult<Option<StateBytes>> {
        self.ensure_open()?;
        self.params.check_key(key)?;
        let tables = self.tables.read().await;
        Ok(tables
            .tables
            .get(state)
            .and_then(|table| table.get(key))
            .cloned())
    }

    pub async fn put(&self, state: &str, key: StateKey, value: StateBytes) -> StateResult<()> {
        self.ensure_open()?;
        self.params.check_key(&key)?;
        let mut guard = self.tables.write().await;
        let tables = Arc::make_mut(&mut *guard);
        tables.version += 1;
        tables
            .tables
            .entry(state.to_owned())
            .or_default()
            .insert(key, value);
        Ok(())
    }

    pub async fn remove(&self, state: &str, key: &StateKey) -> StateResult<Option<StateBytes>> {
        self.ensure_open()?;
        self.params.check_key(key)?;
        let mut guard = self.tables.write().await;
        if !guard.tables.get(state).map_or(false, |table| table.contains_key(key)) {
            return Ok(None);
        }
        let tables = Arc::make_mut(&mut *guard);
        tables.version += 1;
        Ok(tables
            .tables
            .get_mut(state)
            .and_then(|table| table.remove(key)))
    }

    /// Number of writes applied since open.
    pub async fn version(&self) -> StateResult<u64> {
        self.ensure_open()?;
        Ok(self.tables.read().await.version)
    }

    /// Pin the current version. Later writes do not show up in the
    /// returned view.
    pub async fn pin_view(&self) -> StateResult<StateView> {
        self.ensure_open()?;
        Ok(StateView(self.tables.read().await.clone()))
    }
}

impl KeyContext for AsyncKeyedStateBackend {
    fn current_key(&self) -> Option<StateKey> {
        self.current_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Closeable for AsyncKeyedStateBackend {
    fn name(&self) -> &'static str {
        "async keyed state backend"
    }

    fn close(&self) -> StateResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("Closing async keyed backend of {}", self.params.step_id);
        self.current_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        // A reader in flight keeps its version alive until it is done;
        // access after this point is refused anyway.
        if let Ok(mut guard) = self.tables.try_write() {
            *guard = Arc::default();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemStorage;

    const MAX_PAR: u32 = 4;

    fn params() -> KeyedBackendParams {
        KeyedBackendParams {
            step_id: StepId("join".to_owned()),
            key_serializer: KeySerializer::new("string", 1),
            key_groups: KeyGroupRange::new(KeyGroup(0), KeyGroup(MAX_PAR - 1)).unwrap(),
            max_parallelism: MAX_PAR,
        }
    }

    fn key(s: &str) -> StateKey {
        StateKey(s.to_owned())
    }

    #[tokio::test]
    async fn put_then_get() {
        let storage = InMemStorage::new();
        let (backend, _) = AsyncKeyedStateBackend::open(params(), &storage, &[]).unwrap();

        backend
            .put("seen", key("a"), StateBytes(vec![1]))
            .await
            .unwrap();
        assert_eq!(
            backend.get("seen", &key("a")).await.unwrap(),
            Some(StateBytes(vec![1]))
        );
        assert_eq!(backend.get("seen", &key("b")).await.unwrap(), None);
        assert_eq!(backend.version().await.unwrap(), 1);

        assert_eq!(backend.remove("seen", &key("b")).await.unwrap(), None);
        assert_eq!(backend.version().await.unwrap(), 1);
        assert_eq!(
            backend.remove("seen", &key("a")).await.unwrap(),
            Some(StateBytes(vec![1]))
        );
        assert_eq!(backend.version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pinned_view_is_isolated_from_later_writes() {
        let storage = InMemStorage::new();
        let (backend, _) = AsyncKeyedStateBackend::open(params(), &storage, &[]).unwrap();
        backend
            .put("seen", key("a"), StateBytes(vec![1]))
            .await
            .unwrap();

        let view = backend.pin_view().await.unwrap();
        backend
            .put("seen", key("a"), StateBytes(vec![2]))
            .await
            .unwrap();
        backend
            .put("seen", key("b"), StateBytes(vec![3]))
            .await
            .unwrap();

        assert_eq!(view.version(), 1);
        assert_eq!(view.get("seen", &key("a")), Some(&StateBytes(vec![1])));
        assert_eq!(view.get("seen", &key("b")), None);
        assert_eq!(view.len(), 1);
        assert_eq!(backend.pin_view().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn restores_from_portable_snapshot() {
        let storage = InMemStorage::new();
        let handle = StateHandle::keyed(
            "keyed-0",
            CheckpointId(3),
            HandleKind::Keyed,
            SnapshotFormat::Portable,
            params().key_groups,
        );
        let a = key("a");
        for group in params().key_groups.iter() {
            let mut snap = KeyGroupSnapshot::new(group, KeySerializer::new("string", 1));
            if group == KeyGroup::of(&a, MAX_PAR) {
                snap.entries.push(StateEntry {
                    state: "seen".to_owned(),
                    key: a.clone(),
                    value: StateBytes(vec![5]),
                });
            }
            storage.insert_key_group(&handle, &snap).unwrap();
        }

        let (backend, _) = AsyncKeyedStateBackend::open(params(), &storage, &[handle]).unwrap();
        assert!(backend.is_restored());
        assert_eq!(
            backend.get("seen", &a).await.unwrap(),
            Some(StateBytes(vec![5]))
        );
        backend.close().unwrap();
        assert_eq!(storage.stats().live_leases(), 0);
        let err = backend.get("seen", &a).await.unwrap_err();
        assert!(matches!(err, StateError::ResourceAlreadyReleased(_)));
    }

    #[test]
    fn rejects_heap_snapshot() {
        let storage = InMemStorage::new();
        let handle = StateHandle::keyed(
            "keyed-0",
            CheckpointId(3),
            HandleKind::Keyed,
            SnapshotFormat::Heap,
            params().key_groups,
        );
        let err = AsyncKeyedStateBackend::open(params(), &storage, &[handle])
            .err()
            .unwrap();
        assert!(matches!(err, StateError::RestoreFailure { .. }));
    }

    #[test]
    fn current_key_is_the_timer_key_context() {
        let storage = InMemStorage::new();
        let (backend, _) = AsyncKeyedStateBackend::open(params(), &storage, &[]).unwrap();
        assert_eq!(backend.current_key(), None);
        backend.set_current_key(key("z")).unwrap();
        assert_eq!(backend.current_key(), Some(key("z")));
    }
}
