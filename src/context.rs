//! The initialization context handed to an operator on startup.
//!
//! An [`InitializationContext`] is built once per task attempt by
//! [`crate::builder::StateContextBuilder`], read by the operator's
//! initialize routine, and then turned into [`TaskStateHandles`]
//! which the task runtime keeps until teardown. Raw state inputs
//! belong to the context and are always closed before
//! [`initialize_operator`] returns.

use std::sync::Arc;

use crate::backend::AsyncKeyedStateBackend;
use crate::backend::Closeable;
use crate::backend::KeyedStateBackend;
use crate::backend::OperatorStateBackend;
use crate::errors::StateResult;
use crate::model::*;
use crate::raw::RawKeyedInputs;
use crate::raw::RawOperatorInputs;
use crate::timers::TimerServiceManager;

/// A keyed backend together with the timers bound to its key.
pub(crate) struct KeyedPair<B> {
    pub(crate) backend: Arc<B>,
    pub(crate) timers: Arc<TimerServiceManager>,
}

/// Everything only a keyed task has.
pub(crate) struct KeyedParts {
    pub(crate) key_serializer: KeySerializer,
    pub(crate) sync: Option<KeyedPair<KeyedStateBackend>>,
    pub(crate) async_: Option<KeyedPair<AsyncKeyedStateBackend>>,
    pub(crate) raw_inputs: RawKeyedInputs,
}

pub struct InitializationContext {
    pub(crate) restored_checkpoint_id: Option<CheckpointId>,
    pub(crate) operator_backend: Arc<OperatorStateBackend>,
    pub(crate) raw_operator_inputs: RawOperatorInputs,
    pub(crate) keyed: Option<KeyedParts>,
}

impl InitializationContext {
    /// The checkpoint state was restored from, or `None` on a fresh
    /// start.
    pub fn restored_checkpoint_id(&self) -> Option<CheckpointId> {
        self.restored_checkpoint_id
    }

    pub fn is_restored(&self) -> bool {
        self.restored_checkpoint_id.is_some()
    }

    pub fn operator_state_backend(&self) -> &Arc<OperatorStateBackend> {
        &self.operator_backend
    }

    /// Present iff the task is keyed.
    pub fn key_serializer(&self) -> Option<&KeySerializer> {
        self.keyed.as_ref().map(|keyed| &keyed.key_serializer)
    }

    pub fn keyed_state_backend(&self) -> Option<&Arc<KeyedStateBackend>> {
        self.sync_pair().map(|pair| &pair.backend)
    }

    /// Timers bound to [`Self::keyed_state_backend`].
    pub fn timer_service_manager(&self) -> Option<&Arc<TimerServiceManager>> {
        self.sync_pair().map(|pair| &pair.timers)
    }

    pub fn async_keyed_state_backend(&self) -> Option<&Arc<AsyncKeyedStateBackend>> {
        self.async_pair().map(|pair| &pair.backend)
    }

    /// Timers bound to [`Self::async_keyed_state_backend`].
    pub fn async_timer_service_manager(&self) -> Option<&Arc<TimerServiceManager>> {
        self.async_pair().map(|pair| &pair.timers)
    }

    pub fn raw_operator_state_inputs(&mut self) -> &mut RawOperatorInputs {
        &mut self.raw_operator_inputs
    }

    /// Present iff the task is keyed.
    pub fn raw_keyed_state_inputs(&mut self) -> Option<&mut RawKeyedInputs> {
        self.keyed.as_mut().map(|keyed| &mut keyed.raw_inputs)
    }

    fn sync_pair(&self) -> Option<&KeyedPair<KeyedStateBackend>> {
        self.keyed.as_ref().and_then(|keyed| keyed.sync.as_ref())
    }

    fn async_pair(&self) -> Option<&KeyedPair<AsyncKeyedStateBackend>> {
        self.keyed.as_ref().and_then(|keyed| keyed.async_.as_ref())
    }

    /// Close both raw input sequences. Safe to call more than once.
    pub fn close_raw_inputs(&mut self) {
        self.raw_operator_inputs.close();
        if let Some(keyed) = self.keyed.as_mut() {
            keyed.raw_inputs.close();
        }
    }

    /// Close the raw inputs and hand the backends and timers over.
    pub fn into_handles(mut self) -> TaskStateHandles {
        self.close_raw_inputs();
        let (keyed, async_keyed) = match self.keyed {
            Some(keyed) => (keyed.sync, keyed.async_),
            None => (None, None),
        };
        TaskStateHandles {
            restored_checkpoint_id: self.restored_checkpoint_id,
            operator_backend: self.operator_backend,
            keyed_backend: keyed.as_ref().map(|pair| pair.backend.clone()),
            timer_service_manager: keyed.map(|pair| pair.timers),
            async_keyed_backend: async_keyed.as_ref().map(|pair| pair.backend.clone()),
            async_timer_service_manager: async_keyed.map(|pair| pair.timers),
        }
    }
}

/// Backends and timer managers owned by the running task.
pub struct TaskStateHandles {
    pub restored_checkpoint_id: Option<CheckpointId>,
    pub operator_backend: Arc<OperatorStateBackend>,
    pub keyed_backend: Option<Arc<KeyedStateBackend>>,
    pub timer_service_manager: Option<Arc<TimerServiceManager>>,
    pub async_keyed_backend: Option<Arc<AsyncKeyedStateBackend>>,
    pub async_timer_service_manager: Option<Arc<TimerServiceManager>>,
}

impl TaskStateHandles {
    /// In the order they should be closed: last opened first.
    fn closeables(&self) -> Vec<Arc<dyn Closeable>> {
        let mut all: Vec<Arc<dyn Closeable>> = Vec::new();
        if let Some(timers) = &self.async_timer_service_manager {
            all.push(timers.clone());
        }
        if let Some(backend) = &self.async_keyed_backend {
            all.push(backend.clone());
        }
        if let Some(timers) = &self.timer_service_manager {
            all.push(timers.clone());
        }
        if let Some(backend) = &self.keyed_backend {
            all.push(backend.clone());
        }
        all.push(self.operator_backend.clone());
        all
    }

    /// Task teardown. Closes everything, returning the first error.
    pub fn close(&self) -> StateResult<()> {
        let mut first_err = None;
        for closeable in self.closeables() {
            if let Err(err) = closeable.close() {
                tracing::warn!("Error closing {}: {err}", closeable.name());
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Operator side of initialization.
pub trait StreamOperator {
    /// Read restored state and register what the operator needs.
    fn initialize_state(&mut self, ctx: &mut InitializationContext) -> StateResult<()>;
}

/// Run an operator's initialize routine over `ctx`.
///
/// Raw inputs are closed whatever the outcome. On success the
/// backends are handed to the caller; on failure they are closed.
pub fn initialize_operator<O>(
    operator: &mut O,
    mut ctx: InitializationContext,
) -> StateResult<TaskStateHandles>
where
    O: StreamOperator + ?Sized,
{
    let res = operator.initialize_state(&mut ctx);
    let handles = ctx.into_handles();
    match res {
        Ok(()) => Ok(handles),
        Err(err) => {
            if let Err(close_err) = handles.close() {
                tracing::warn!("Error closing state after failed initialize: {close_err}");
            }
            Err(err)
        }
    }
}
