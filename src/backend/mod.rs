//! State backends a task can be initialized with.
//!
//! Keyed state comes in two concurrency variants: the synchronous
//! [`keyed::KeyedStateBackend`] and the copy-on-write
//! [`async_keyed::AsyncKeyedStateBackend`]. Which of them a task gets
//! is decided by [`BackendCapabilities::resolve`]. Non-keyed state
//! always lives in an [`operator::OperatorStateBackend`].

use std::collections::HashMap;
use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::StateError;
use crate::errors::StateResult;
use crate::model::*;
use crate::storage::HandleLease;
use crate::storage::SnapshotStorage;

pub mod async_keyed;
pub mod keyed;
pub mod operator;

pub use async_keyed::AsyncKeyedStateBackend;
pub use async_keyed::StateView;
pub use keyed::KeyedStateBackend;
pub use operator::OperatorStateBackend;

/// Which keyed variants the configured backend type can provide.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendSupport {
    SyncOnly,
    AsyncOnly,
    SyncAndAsync,
}

/// Which keyed variants the operator asked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyedMode {
    Sync,
    Async,
    /// Migration window: both variants over the same snapshot.
    Both,
}

/// Capability descriptor consulted when deciding which keyed
/// backends to open.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub support: BackendSupport,
    pub requested: KeyedMode,
}

/// The keyed variants to open for a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyedVariants {
    pub sync: bool,
    pub async_: bool,
}

impl BackendCapabilities {
    pub fn new(support: BackendSupport, requested: KeyedMode) -> Self {
        Self { support, requested }
    }

    pub fn sync_only() -> Self {
        Self::new(BackendSupport::SyncOnly, KeyedMode::Sync)
    }

    /// Decide which keyed variants to open.
    ///
    /// An async request against a sync-only backend falls back to the
    /// sync variant. Any other request the backend cannot serve is a
    /// [`StateError::RestoreFailure`]; in particular asking for both
    /// variants is never narrowed down to one.
    pub fn resolve(&self) -> StateResult<KeyedVariants> {
        use BackendSupport::*;
        use KeyedMode::*;

        match (self.requested, self.support) {
            (Sync, SyncOnly | SyncAndAsync) | (Async, SyncOnly) => Ok(KeyedVariants {
                sync: true,
                async_: false,
            }),
            (Async, AsyncOnly | SyncAndAsync) => Ok(KeyedVariants {
                sync: false,
                async_: true,
            }),
            (Both, SyncAndAsync) => Ok(KeyedVariants {
                sync: true,
                async_: true,
            }),
            (requested, support) => Err(StateError::restore_failure(&format!(
                "operator requested {requested:?} keyed state but the backend is {support:?}"
            ))),
        }
    }
}

/// Gives access to the key currently being processed.
///
/// Timer managers are bound to the key accessor of the keyed backend
/// they were opened with.
pub trait KeyContext: Send + Sync {
    fn current_key(&self) -> Option<StateKey>;
}

/// Resources the builder must be able to release on failure.
pub trait Closeable: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Release everything held. Closing twice is a no-op.
    fn close(&self) -> StateResult<()>;

    fn is_closed(&self) -> bool;
}

/// The two keyed concurrency variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum KeyedVariant {
    Sync,
    Async,
}

impl KeyedVariant {
    /// If this variant can read a snapshot in `format`.
    pub(crate) fn accepts(&self, format: SnapshotFormat) -> bool {
        matches!(
            (self, format),
            (_, SnapshotFormat::Portable)
                | (Self::Sync, SnapshotFormat::Heap)
                | (Self::Async, SnapshotFormat::MultiVersion)
        )
    }
}

impl Display for KeyedVariant {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            Self::Sync => fmt.write_str("sync"),
            Self::Async => fmt.write_str("async"),
        }
    }
}

/// What every keyed backend of a task is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedBackendParams {
    pub step_id: StepId,
    pub key_serializer: KeySerializer,
    pub key_groups: KeyGroupRange,
    pub max_parallelism: u32,
}

impl KeyedBackendParams {
    /// Check a key belongs to this task.
    pub(crate) fn check_key(&self, key: &StateKey) -> StateResult<KeyGroup> {
        let kg = KeyGroup::of(key, self.max_parallelism);
        if self.key_groups.contains(kg) {
            Ok(kg)
        } else {
            Err(StateError::corrupt(&format!(
                "key {key:?} is in {kg} which is outside assigned range {}",
                self.key_groups
            )))
        }
    }
}

/// Named keyed tables: state name to key to value.
pub(crate) type KeyedTables = HashMap<String, HashMap<StateKey, StateBytes>>;

/// Everything read back from keyed handles.
#[derive(Default)]
pub(crate) struct RestoredKeyed {
    pub(crate) tables: KeyedTables,
    pub(crate) timers: Vec<TimerEntry>,
    pub(crate) leases: Vec<HandleLease>,
}

/// Read the key groups of `handles` that fall in the assigned range.
///
/// Handles may come from a run with a different parallelism, so only
/// the overlap with the assigned range is read. A handle with no
/// overlap at all was not meant for this task.
pub(crate) fn restore_keyed(
    params: &KeyedBackendParams,
    variant: KeyedVariant,
    storage: &dyn SnapshotStorage,
    handles: &[StateHandle],
) -> StateResult<RestoredKeyed> {
    let mut restored = RestoredKeyed::default();
    for handle in handles {
        if handle.kind != HandleKind::Keyed {
            return Err(StateError::corrupt(&format!(
                "handle {} is {:?}, not keyed",
                handle.id, handle.kind
            )));
        }
        if !variant.accepts(handle.format) {
            return Err(StateError::restore_failure(&format!(
                "handle {} was written as {:?} which the {variant} keyed backend cannot read",
                handle.id, handle.format
            )));
        }
        let handle_range = handle.key_groups.ok_or_else(|| {
            StateError::corrupt(&format!("keyed handle {} has no key groups", handle.id))
        })?;
        let overlap = handle_range.intersection(&params.key_groups).ok_or_else(|| {
            StateError::corrupt(&format!(
                "handle {} covers key groups {handle_range}, none in assigned range {}",
                handle.id, params.key_groups
            ))
        })?;

        restored.leases.push(storage.retain(&handle.id)?);

        for kg in overlap.iter() {
            let region = handle.key_group_region(kg);
            let snap: KeyGroupSnapshot = storage
                .open_region(&region)
                .and_then(|reader| decode(reader, &region))
                .map_err(|err| {
                    err.into_restore_failure(&format!("Error restoring {variant} keyed region"))
                })?;
            restore_key_group(params, &region, snap, &mut restored)?;
        }
        tracing::debug!(
            "Restored {variant} keyed state for {} from {} ({overlap})",
            params.step_id,
            handle.id
        );
    }
    Ok(restored)
}

fn restore_key_group(
    params: &KeyedBackendParams,
    region: &RegionRef,
    snap: KeyGroupSnapshot,
    restored: &mut RestoredKeyed,
) -> StateResult<()> {
    let expected = region.key_group;
    if Some(snap.key_group) != expected {
        return Err(StateError::corrupt(&format!(
            "region {region} holds data for {}",
            snap.key_group
        )));
    }
    if snap.key_serializer != params.key_serializer {
        return Err(StateError::restore_failure(&format!(
            "region {region} was written with key serializer {} but the task uses {}",
            snap.key_serializer, params.key_serializer
        )));
    }

    let in_group = |key: &StateKey| Some(KeyGroup::of(key, params.max_parallelism)) == expected;
    for entry in snap.entries {
        if !in_group(&entry.key) {
            return Err(StateError::corrupt(&format!(
                "key {:?} in region {region} does not belong to that key group",
                entry.key
            )));
        }
        restored
            .tables
            .entry(entry.state)
            .or_default()
            .insert(entry.key, entry.value);
    }
    for timer in snap.timers {
        if !in_group(&timer.key) {
            return Err(StateError::corrupt(&format!(
                "timer for key {:?} in region {region} does not belong to that key group",
                timer.key
            )));
        }
        restored.timers.push(timer);
    }
    Ok(())
}
