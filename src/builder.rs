//! Assembles an [`InitializationContext`] for one task attempt.
//!
//! Building is all or nothing. Handles are checked for consistency
//! before anything is opened; after that every opened backend and
//! timer manager is recorded, and if a later step fails or the task
//! is cancelled they are closed, last opened first, before the error
//! is returned.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::instrument;

use crate::backend::AsyncKeyedStateBackend;
use crate::backend::BackendCapabilities;
use crate::backend::Closeable;
use crate::backend::KeyContext;
use crate::backend::KeyedBackendParams;
use crate::backend::KeyedStateBackend;
use crate::backend::OperatorStateBackend;
use crate::context::InitializationContext;
use crate::context::KeyedPair;
use crate::context::KeyedParts;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::model::*;
use crate::raw::raw_keyed_inputs;
use crate::raw::raw_operator_inputs;
use crate::raw::RawKeyedInputs;
use crate::storage::SnapshotStorage;
use crate::timers::TimerServiceManager;

/// Set from outside to abort task startup.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Resources opened so far, in opening order.
#[derive(Default)]
struct Rollback {
    opened: Vec<Arc<dyn Closeable>>,
}

impl Rollback {
    fn push(&mut self, closeable: Arc<dyn Closeable>) {
        self.opened.push(closeable);
    }

    /// Close everything opened, last first.
    fn unwind(self) {
        for closeable in self.opened.into_iter().rev() {
            tracing::debug!("Rolling back {}", closeable.name());
            if let Err(err) = closeable.close() {
                tracing::warn!("Error closing {} during rollback: {err}", closeable.name());
            }
        }
    }
}

/// What validation found; nothing in here is open yet.
struct Plan {
    restored_checkpoint_id: Option<CheckpointId>,
    keyed: Option<KeyedPlan>,
}

struct KeyedPlan {
    params: KeyedBackendParams,
    sync: bool,
    async_: bool,
    raw_inputs: RawKeyedInputs,
}

pub struct StateContextBuilder {
    storage: Arc<dyn SnapshotStorage>,
    cancellation: CancellationFlag,
}

impl StateContextBuilder {
    pub fn new(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self {
            storage,
            cancellation: CancellationFlag::default(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    fn check_cancelled(&self) -> StateResult<()> {
        if self.cancellation.is_cancelled() {
            Err(StateError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Build the context for one task attempt.
    ///
    /// `handles` is what the checkpoint coordinator assigned to this
    /// task, `key_groups` the range it owns at the current
    /// parallelism. Non-keyed tasks must get no keyed handles; their
    /// `key_groups` is ignored.
    #[instrument(name = "build_state_context", skip_all, fields(task = %task))]
    pub fn build(
        &self,
        task: &TaskInfo,
        handles: AssignedStateHandles,
        key_groups: KeyGroupRange,
        caps: &BackendCapabilities,
    ) -> StateResult<InitializationContext> {
        let plan = self.validate(task, &handles, key_groups, caps)?;

        let mut rollback = Rollback::default();
        match self.open(task, &handles, plan, &mut rollback) {
            Ok(ctx) => {
                match ctx.restored_checkpoint_id() {
                    Some(chk) => tracing::info!("Restored state for {task} from {chk}"),
                    None => tracing::info!("Initialized fresh state for {task}"),
                }
                Ok(ctx)
            }
            Err(err) => {
                tracing::warn!("State initialization for {task} failed: {err}");
                rollback.unwind();
                Err(err)
            }
        }
    }

    /// Check handle consistency and decide what to open.
    fn validate(
        &self,
        task: &TaskInfo,
        handles: &AssignedStateHandles,
        key_groups: KeyGroupRange,
        caps: &BackendCapabilities,
    ) -> StateResult<Plan> {
        check_kinds(&handles.operator, HandleKind::Operator)?;
        check_kinds(&handles.keyed, HandleKind::Keyed)?;
        check_kinds(&handles.async_keyed, HandleKind::Keyed)?;
        check_kinds(&handles.raw_operator, HandleKind::RawOperator)?;
        check_kinds(&handles.raw_keyed, HandleKind::RawKeyed)?;

        let restored_checkpoint_id = common_checkpoint(handles)?;

        let keyed = match &task.key_serializer {
            None => {
                if !(handles.keyed.is_empty()
                    && handles.async_keyed.is_empty()
                    && handles.raw_keyed.is_empty())
                {
                    return Err(StateError::corrupt(&format!(
                        "non-keyed task {task} was assigned keyed state handles"
                    )));
                }
                None
            }
            Some(key_serializer) => {
                if key_groups.end().0 >= task.max_parallelism {
                    return Err(StateError::invalid_config(&format!(
                        "assigned key groups {key_groups} exceed max parallelism {}",
                        task.max_parallelism
                    )));
                }
                for handle in handles.keyed.iter().chain(&handles.async_keyed) {
                    let in_range = handle
                        .key_groups
                        .and_then(|range| range.intersection(&key_groups));
                    if in_range.is_none() {
                        return Err(StateError::corrupt(&format!(
                            "keyed handle {} has no key groups in assigned range {key_groups}",
                            handle.id
                        )));
                    }
                }
                let variants = caps.resolve()?;
                // A variant that is not opened must not leave handles of
                // its own behind; they are only read through sharing.
                let unread = if !variants.async_ && !handles.keyed.is_empty() {
                    handles.async_keyed.first()
                } else if !variants.sync && !handles.async_keyed.is_empty() {
                    handles.keyed.first()
                } else {
                    None
                };
                if let Some(handle) = unread {
                    return Err(StateError::restore_failure(&format!(
                        "keyed handle {} belongs to a backend variant that is not opened",
                        handle.id
                    )));
                }
                let raw_inputs =
                    raw_keyed_inputs(self.storage.clone(), &handles.raw_keyed, key_groups)?;
                Some(KeyedPlan {
                    params: KeyedBackendParams {
                        step_id: task.step_id.clone(),
                        key_serializer: key_serializer.clone(),
                        key_groups,
                        max_parallelism: task.max_parallelism,
                    },
                    sync: variants.sync,
                    async_: variants.async_,
                    raw_inputs,
                })
            }
        };

        Ok(Plan {
            restored_checkpoint_id,
            keyed,
        })
    }

    fn open(
        &self,
        task: &TaskInfo,
        handles: &AssignedStateHandles,
        plan: Plan,
        rollback: &mut Rollback,
    ) -> StateResult<InitializationContext> {
        self.check_cancelled()?;
        let storage = self.storage.as_ref();

        let operator_backend = Arc::new(OperatorStateBackend::open(
            task.step_id.clone(),
            storage,
            &handles.operator,
        )?);
        rollback.push(operator_backend.clone());
        self.check_cancelled()?;

        let keyed = match plan.keyed {
            None => None,
            Some(keyed) => {
                // A variant with no handles of its own reads the
                // other variant's.
                let sync_handles = shared_handles(&handles.keyed, &handles.async_keyed);
                let async_handles = shared_handles(&handles.async_keyed, &handles.keyed);

                let sync = if keyed.sync {
                    let (backend, timers) =
                        KeyedStateBackend::open(keyed.params.clone(), storage, sync_handles)?;
                    let pair =
                        pair_with_timers(&task.step_id, Arc::new(backend), timers, rollback)?;
                    self.check_cancelled()?;
                    Some(pair)
                } else {
                    None
                };

                let async_ = if keyed.async_ {
                    let (backend, timers) = AsyncKeyedStateBackend::open(
                        keyed.params.clone(),
                        storage,
                        async_handles,
                    )?;
                    let pair =
                        pair_with_timers(&task.step_id, Arc::new(backend), timers, rollback)?;
                    self.check_cancelled()?;
                    Some(pair)
                } else {
                    None
                };

                Some(KeyedParts {
                    key_serializer: keyed.params.key_serializer,
                    sync,
                    async_,
                    raw_inputs: keyed.raw_inputs,
                })
            }
        };

        Ok(InitializationContext {
            restored_checkpoint_id: plan.restored_checkpoint_id,
            operator_backend,
            raw_operator_inputs: raw_operator_inputs(self.storage.clone(), &handles.raw_operator),
            keyed,
        })
    }
}

fn pair_with_timers<B>(
    step_id: &StepId,
    backend: Arc<B>,
    restored_timers: Vec<TimerEntry>,
    rollback: &mut Rollback,
) -> StateResult<KeyedPair<B>>
where
    B: KeyContext + Closeable + 'static,
{
    rollback.push(backend.clone());
    let timers = Arc::new(TimerServiceManager::new(
        step_id.clone(),
        backend.clone(),
        restored_timers,
    )?);
    rollback.push(timers.clone());
    Ok(KeyedPair { backend, timers })
}

fn shared_handles<'a>(own: &'a [StateHandle], other: &'a [StateHandle]) -> &'a [StateHandle] {
    if own.is_empty() {
        other
    } else {
        own
    }
}

fn check_kinds(handles: &[StateHandle], kind: HandleKind) -> StateResult<()> {
    match handles.iter().find(|handle| handle.kind != kind) {
        Some(handle) => Err(StateError::corrupt(&format!(
            "handle {} is {:?} but was assigned as {kind:?}",
            handle.id, handle.kind
        ))),
        None => Ok(()),
    }
}

/// The checkpoint every assigned handle was taken in.
fn common_checkpoint(handles: &AssignedStateHandles) -> StateResult<Option<CheckpointId>> {
    let mut found: Option<&StateHandle> = None;
    for handle in handles.iter() {
        match found {
            None => found = Some(handle),
            Some(first) if first.checkpoint_id != handle.checkpoint_id => {
                return Err(StateError::corrupt(&format!(
                    "handle {} is from {} but handle {} is from {}",
                    handle.id, handle.checkpoint_id, first.id, first.checkpoint_id
                )));
            }
            Some(_) => {}
        }
    }
    Ok(found.map(|handle| handle.checkpoint_id))
}
