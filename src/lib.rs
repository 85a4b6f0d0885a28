//! State initialization for tasks of a checkpointed dataflow.
//!
//! When a task attempt starts it calls
//! [`builder::StateContextBuilder::build`] with the state handles the
//! checkpoint coordinator assigned it. The result is an
//! [`context::InitializationContext`] holding the operator state
//! backend, the keyed backends and their timer managers if the task
//! is keyed, lazily opened raw state inputs, and the checkpoint the
//! state was restored from. The operator reads it in
//! [`context::initialize_operator`], after which the runtime keeps
//! the backends as [`context::TaskStateHandles`].

pub mod backend;
pub mod builder;
pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod model;
pub mod raw;
pub mod storage;
pub mod timers;

pub use builder::CancellationFlag;
pub use builder::StateContextBuilder;
pub use context::initialize_operator;
pub use context::InitializationContext;
pub use context::StreamOperator;
pub use context::TaskStateHandles;
pub use errors::StateError;
pub use errors::StateResult;
