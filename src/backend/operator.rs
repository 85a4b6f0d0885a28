//! Non-keyed operator state.
//!
//! Every task has one of these, even if it is empty. List states are
//! either split between tasks on rescale or given whole to each task
//! (union); handles assigned to this task are merged on restore.
//! Broadcast map states are the same on every task, so the first
//! handle carrying one wins.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tracing::instrument;

use super::Closeable;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::model::*;
use crate::storage::HandleLease;
use crate::storage::SnapshotStorage;

#[derive(Debug, Clone)]
struct ListState {
    distribution: Distribution,
    items: Vec<StateBytes>,
}

#[derive(Default)]
struct OperatorInner {
    lists: BTreeMap<String, ListState>,
    broadcast: BTreeMap<String, BTreeMap<String, StateBytes>>,
    leases: Vec<HandleLease>,
    closed: bool,
}

pub struct OperatorStateBackend {
    step_id: StepId,
    restored: bool,
    inner: Mutex<OperatorInner>,
}

impl OperatorStateBackend {
    #[instrument(name = "open_operator_backend", skip_all, fields(step_id = %step_id))]
    pub fn open(
        step_id: StepId,
        storage: &dyn SnapshotStorage,
        handles: &[StateHandle],
    ) -> StateResult<Self> {
        let mut inner = OperatorInner::default();
        for handle in handles {
            if handle.kind != HandleKind::Operator {
                return Err(StateError::corrupt(&format!(
                    "handle {} is {:?}, not operator state",
                    handle.id, handle.kind
                )));
            }
            inner.leases.push(storage.retain(&handle.id)?);

            let region = handle.region();
            let snap: OperatorSnapshot = storage
                .open_region(&region)
                .and_then(|reader| decode(reader, &region))
                .map_err(|err| err.into_restore_failure("Error restoring operator state"))?;
            merge_snapshot(&mut inner, &region, snap)?;
        }
        if !handles.is_empty() {
            tracing::debug!(
                "Restored operator state for {step_id} from {} handles",
                handles.len()
            );
        }

        Ok(Self {
            step_id,
            restored: !handles.is_empty(),
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> StateResult<MutexGuard<'_, OperatorInner>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            Err(StateError::released(&format!(
                "operator backend of {} is closed",
                self.step_id
            )))
        } else {
            Ok(inner)
        }
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// If there is no state registered at all.
    pub fn is_empty(&self) -> StateResult<bool> {
        let inner = self.lock()?;
        Ok(inner.lists.is_empty() && inner.broadcast.is_empty())
    }

    fn list_with(&self, name: &str, distribution: Distribution) -> StateResult<Vec<StateBytes>> {
        let mut inner = self.lock()?;
        let list = inner
            .lists
            .entry(name.to_owned())
            .or_insert_with(|| ListState {
                distribution,
                items: Vec::new(),
            });
        if list.distribution != distribution {
            return Err(StateError::restore_failure(&format!(
                "list state {name:?} of {} is {:?}, requested as {distribution:?}",
                self.step_id, list.distribution
            )));
        }
        Ok(list.items.clone())
    }

    /// Get or register a split-distribute list state.
    pub fn list_state(&self, name: &str) -> StateResult<Vec<StateBytes>> {
        self.list_with(name, Distribution::SplitDistribute)
    }

    /// Get or register a union list state.
    pub fn union_list_state(&self, name: &str) -> StateResult<Vec<StateBytes>> {
        self.list_with(name, Distribution::Union)
    }

    /// Append to a list state, registering it as split-distribute if
    /// it does not exist yet.
    pub fn add_to_list(&self, name: &str, item: StateBytes) -> StateResult<()> {
        let mut inner = self.lock()?;
        inner
            .lists
            .entry(name.to_owned())
            .or_insert_with(|| ListState {
                distribution: Distribution::SplitDistribute,
                items: Vec::new(),
            })
            .items
            .push(item);
        Ok(())
    }

    /// Replace the items of a list state.
    pub fn update_list(&self, name: &str, items: Vec<StateBytes>) -> StateResult<()> {
        let mut inner = self.lock()?;
        inner
            .lists
            .entry(name.to_owned())
            .or_insert_with(|| ListState {
                distribution: Distribution::SplitDistribute,
                items: Vec::new(),
            })
            .items = items;
        Ok(())
    }

    pub fn broadcast_get(&self, name: &str, key: &str) -> StateResult<Option<StateBytes>> {
        let inner = self.lock()?;
        Ok(inner
            .broadcast
            .get(name)
            .and_then(|state| state.get(key))
            .cloned())
    }

    pub fn broadcast_put(&self, name: &str, key: String, value: StateBytes) -> StateResult<()> {
        let mut inner = self.lock()?;
        inner
            .broadcast
            .entry(name.to_owned())
            .or_default()
            .insert(key, value);
        Ok(())
    }

    /// All entries of one broadcast state.
    pub fn broadcast_state(&self, name: &str) -> StateResult<BTreeMap<String, StateBytes>> {
        let inner = self.lock()?;
        Ok(inner.broadcast.get(name).cloned().unwrap_or_default())
    }

    /// Names of all list and broadcast states, sorted.
    pub fn registered_state_names(&self) -> StateResult<Vec<String>> {
        let inner = self.lock()?;
        let mut names: Vec<String> = inner
            .lists
            .keys()
            .chain(inner.broadcast.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

fn merge_snapshot(
    inner: &mut OperatorInner,
    region: &RegionRef,
    snap: OperatorSnapshot,
) -> StateResult<()> {
    for entry in snap.lists {
        match inner.lists.get_mut(&entry.name) {
            Some(list) if list.distribution != entry.distribution => {
                return Err(StateError::corrupt(&format!(
                    "list state {:?} in region {region} is {:?} but another handle has it as {:?}",
                    entry.name, entry.distribution, list.distribution
                )));
            }
            Some(list) => list.items.extend(entry.items),
            None => {
                inner.lists.insert(
                    entry.name,
                    ListState {
                        distribution: entry.distribution,
                        items: entry.items,
                    },
                );
            }
        }
    }
    for (name, state) in snap.broadcast {
        inner.broadcast.entry(name).or_insert(state);
    }
    Ok(())
}

impl Closeable for OperatorStateBackend {
    fn name(&self) -> &'static str {
        "operator state backend"
    }

    fn close(&self) -> StateResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Ok(());
        }
        tracing::debug!("Closing operator backend of {}", self.step_id);
        inner.closed = true;
        inner.lists.clear();
        inner.broadcast.clear();
        inner.leases.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}
