//! The data model shared by the state backends and the context
//! builder.
//!
//! [`handles`] describes what the checkpoint coordinator hands a task
//! on restore, and [`snapshot`] is the payload format stored in each
//! persisted region.

use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::ErrorContext;
use crate::errors::StateError;
use crate::errors::StateResult;

pub mod handles;
pub mod snapshot;

pub use handles::*;
pub use snapshot::*;

/// Id of the checkpoint or savepoint state was taken in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub u64);

impl Display for CheckpointId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "chk-{}", self.0)
    }
}

/// Unique ID for a step in a dataflow.
///
/// Recovery data is keyed off of this to ensure state is not mixed
/// between operators.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepId(pub String);

impl Display for StepId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.0)
    }
}

/// Key to route state within a dataflow step.
///
/// Keyed state is always scoped to one of these. Which task owns a
/// key is decided by the key's [`KeyGroup`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKey(pub String);

impl Display for StateKey {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.0)
    }
}

/// A serialized state value.
///
/// Backends only deal in bytes so each operator can store custom
/// types without the backends knowing about them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serialize a state object from an operator into bytes a
    /// backend can store.
    pub fn ser<T: Serialize>(obj: &T) -> StateResult<Self> {
        let t_name = std::any::type_name::<T>();
        serde_json::to_vec(obj)
            .map(Self)
            .or_restore_failure(&format!("Error serializing state type {t_name}"))
    }

    /// Deserialize these bytes back into an operator's state object.
    pub fn de<T: DeserializeOwned>(&self) -> StateResult<T> {
        let t_name = std::any::type_name::<T>();
        serde_json::from_slice(&self.0)
            .or_restore_failure(&format!("Error deserializing state type {t_name}"))
    }
}

/// A fixed sub-range of the hashed key space.
///
/// The unit of state partitioning and of reassignment when
/// parallelism changes. Always less than the max parallelism.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyGroup(pub u32);

impl KeyGroup {
    /// The key group a key belongs to.
    pub fn of(key: &StateKey, max_parallelism: u32) -> Self {
        debug_assert!(max_parallelism > 0, "max parallelism must be positive");
        let hash = seahash::hash(key.0.as_bytes());
        Self((hash % u64::from(max_parallelism)) as u32)
    }
}

impl Display for KeyGroup {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "kg-{}", self.0)
    }
}

/// An inclusive range of key groups `[start, end]`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "UncheckedKeyGroupRange")]
pub struct KeyGroupRange {
    start: KeyGroup,
    end: KeyGroup,
}

/// Wire form of [`KeyGroupRange`] before its bounds are checked.
#[derive(Deserialize)]
#[serde(rename = "KeyGroupRange")]
struct UncheckedKeyGroupRange {
    start: KeyGroup,
    end: KeyGroup,
}

impl TryFrom<UncheckedKeyGroupRange> for KeyGroupRange {
    type Error = StateError;

    fn try_from(range: UncheckedKeyGroupRange) -> StateResult<Self> {
        Self::new(range.start, range.end)
    }
}

impl KeyGroupRange {
    pub fn new(start: KeyGroup, end: KeyGroup) -> StateResult<Self> {
        if start > end {
            Err(StateError::corrupt(&format!(
                "key group range start {start} is after end {end}"
            )))
        } else {
            Ok(Self { start, end })
        }
    }

    /// A range with one key group in it.
    pub fn single(key_group: KeyGroup) -> Self {
        Self {
            start: key_group,
            end: key_group,
        }
    }

    /// The range owned by a subtask when `max_parallelism` key
    /// groups are split evenly and contiguously over `parallelism`
    /// subtasks.
    pub fn for_subtask(
        max_parallelism: u32,
        parallelism: u32,
        subtask_index: u32,
    ) -> StateResult<Self> {
        if parallelism == 0 || max_parallelism < parallelism {
            return Err(StateError::invalid_config(&format!(
                "parallelism {parallelism} must be in 1..={max_parallelism}"
            )));
        }
        if subtask_index >= parallelism {
            return Err(StateError::invalid_config(&format!(
                "subtask {subtask_index} out of bounds for parallelism {parallelism}"
            )));
        }
        let max = u64::from(max_parallelism);
        let par = u64::from(parallelism);
        let ix = u64::from(subtask_index);
        let start = (ix * max + par - 1) / par;
        let end = ((ix + 1) * max + par - 1) / par - 1;
        Self::new(KeyGroup(start as u32), KeyGroup(end as u32))
    }

    pub fn start(&self) -> KeyGroup {
        self.start
    }

    pub fn end(&self) -> KeyGroup {
        self.end
    }

    pub fn contains(&self, key_group: KeyGroup) -> bool {
        self.start <= key_group && key_group <= self.end
    }

    pub fn len(&self) -> usize {
        (self.end.0 - self.start.0) as usize + 1
    }

    /// Ranges are never empty; this exists to pair with [`Self::len`].
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Return an iter of all key groups in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = KeyGroup> {
        (self.start.0..=self.end.0).map(KeyGroup)
    }

    pub fn intersection(&self, other: &KeyGroupRange) -> Option<KeyGroupRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(KeyGroupRange { start, end })
    }
}

impl Display for KeyGroupRange {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "[{}, {}]", self.start.0, self.end.0)
    }
}

/// Describes how keys of a keyed step are serialized.
///
/// Keyed snapshots record the serializer they were written with; a
/// restore under a different one is refused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySerializer {
    pub name: String,
    pub version: u32,
}

impl KeySerializer {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl Display for KeySerializer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "{}@v{}", self.name, self.version)
    }
}

/// Everything about the task attempt being initialized that the
/// builder needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub step_id: StepId,
    pub subtask_index: u32,
    /// How many times this subtask has been started; 0 is the first.
    pub attempt: u32,
    /// Total number of key groups.
    pub max_parallelism: u32,
    /// Present iff the step is keyed.
    pub key_serializer: Option<KeySerializer>,
}

impl TaskInfo {
    pub fn is_keyed(&self) -> bool {
        self.key_serializer.is_some()
    }
}

impl Display for TaskInfo {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(
            fmt,
            "{}#{} (attempt {})",
            self.step_id, self.subtask_index, self.attempt
        )
    }
}
