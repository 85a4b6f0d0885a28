//! The synchronous keyed state backend.
//!
//! Values are scoped to the current key, which the operator sets
//! before touching state for a record. All access is blocking; a
//! snapshot of this backend would stop processing while it runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

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

struct KeyedInner {
    current_key: Option<StateKey>,
    tables: KeyedTables,
    leases: Vec<HandleLease>,
    closed: bool,
}

pub struct KeyedStateBackend {
    params: KeyedBackendParams,
    restored: bool,
    inner: Mutex<KeyedInner>,
}

impl KeyedStateBackend {
    /// Open the backend, restoring from `handles` if there are any.
    ///
    /// Returns the timers found next to the keyed data, so the paired
    /// timer manager is restored from the same handles.
    #[instrument(name = "open_keyed_backend", skip_all, fields(step_id = %params.step_id))]
    pub fn open(
        params: KeyedBackendParams,
        storage: &dyn SnapshotStorage,
        handles: &[StateHandle],
    ) -> StateResult<(Self, Vec<TimerEntry>)> {
        let restored = restore_keyed(&params, KeyedVariant::Sync, storage, handles)?;
        let backend = Self {
            params,
            restored: !handles.is_empty(),
            inner: Mutex::new(KeyedInner {
                current_key: None,
                tables: restored.tables,
                leases: restored.leases,
                closed: false,
            }),
        };
        Ok((backend, restored.timers))
    }

    fn lock(&self) -> StateResult<MutexGuard<'_, KeyedInner>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            Err(StateError::released(&format!(
                "keyed backend of {} is closed",
                self.params.step_id
            )))
        } else {
            Ok(inner)
        }
    }

    fn lock_with_key(&self) -> StateResult<(MutexGuard<'_, KeyedInner>, StateKey)> {
        let inner = self.lock()?;
        let key = inner
            .current_key
            .clone()
            .ok_or_else(|| StateError::NoCurrentKey(self.params.step_id.to_string()))?;
        Ok((inner, key))
    }

    pub fn key_serializer(&self) -> &KeySerializer {
        &self.params.key_serializer
    }

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.params.key_groups
    }

    /// If this backend was built from previously persisted state.
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// Scope following state access to `key`.
    pub fn set_current_key(&self, key: StateKey) -> StateResult<()> {
        self.params.check_key(&key)?;
        self.lock()?.current_key = Some(key);
        Ok(())
    }

    pub fn get(&self, state: &str) -> StateResult<Option<StateBytes>> {
        let (inner, key) = self.lock_with_key()?;
        Ok(inner
            .tables
            .get(state)
            .and_then(|table| table.get(&key))
            .cloned())
    }

    pub fn put(&self, state: &str, value: StateBytes) -> StateResult<()> {
        let (mut inner, key) = self.lock_with_key()?;
        inner
            .tables
            .entry(state.to_owned())
            .or_default()
            .insert(key, value);
        Ok(())
    }

    pub fn remove(&self, state: &str) -> StateResult<Option<StateBytes>> {
        let (mut inner, key) = self.lock_with_key()?;
        Ok(inner
            .tables
            .get_mut(state)
            .and_then(|table| table.remove(&key)))
    }

    /// All keys with a value in a state, sorted.
    pub fn keys(&self, state: &str) -> StateResult<Vec<StateKey>> {
        let inner = self.lock()?;
        let mut keys: Vec<_> = inner
            .tables
            .get(state)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    /// Names of states with at least one value, sorted.
    pub fn state_names(&self) -> StateResult<Vec<String>> {
        let inner = self.lock()?;
        let mut names: Vec<_> = inner
            .tables
            .iter()
            .filter(|(_, table)| !table.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Number of values per state.
    pub fn num_entries(&self) -> StateResult<HashMap<String, usize>> {
        let inner = self.lock()?;
        Ok(inner
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.len()))
            .collect())
    }
}

impl KeyContext for KeyedStateBackend {
    fn current_key(&self) -> Option<StateKey> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current_key
            .clone()
    }
}

impl Closeable for KeyedStateBackend {
    fn name(&self) -> &'static str {
        "keyed state backend"
    }

    fn close(&self) -> StateResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.closed {
            tracing::debug!("Closing keyed backend of {}", self.params.step_id);
            inner.closed = true;
            inner.current_key = None;
            inner.tables.clear();
            inner.leases.clear();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}
