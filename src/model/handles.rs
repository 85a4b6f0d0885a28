//! Descriptors of previously persisted state, as handed to a task by
//! the checkpoint coordinator.
//!
//! A [`StateHandle`] is opaque to everything but the storage layer:
//! it names persisted regions, it does not hold their bytes.

use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use super::CheckpointId;
use super::KeyGroup;
use super::KeyGroupRange;
use crate::errors::StateError;
use crate::errors::StateResult;

/// Storage-level name of a state handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub String);

impl Display for HandleId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.0)
    }
}

/// Which backend a handle's contents belong to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    /// Non-keyed operator state; one region per handle.
    Operator,
    /// Keyed backend state; one region per key group.
    Keyed,
    /// Raw operator state bytes; one region per handle.
    RawOperator,
    /// Raw keyed state bytes; one region per key group.
    RawKeyed,
}

impl HandleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Keyed => "keyed",
            Self::RawOperator => "raw_operator",
            Self::RawKeyed => "raw_keyed",
        }
    }

    pub fn parse(s: &str) -> StateResult<Self> {
        match s {
            "operator" => Ok(Self::Operator),
            "keyed" => Ok(Self::Keyed),
            "raw_operator" => Ok(Self::RawOperator),
            "raw_keyed" => Ok(Self::RawKeyed),
            other => Err(StateError::corrupt(&format!("unknown handle kind {other:?}"))),
        }
    }

    /// Keyed kinds carry key groups, the others are operator-scoped.
    pub fn is_keyed(&self) -> bool {
        matches!(self, Self::Keyed | Self::RawKeyed)
    }
}

/// The on-storage layout of a keyed snapshot.
///
/// Synchronous and asynchronous backends can both read
/// [`SnapshotFormat::Portable`]; each native layout is only readable
/// by the variant that wrote it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotFormat {
    Portable,
    /// Written by the synchronous heap backend.
    Heap,
    /// Written by the asynchronous multi-version backend.
    MultiVersion,
}

impl SnapshotFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Portable => "portable",
            Self::Heap => "heap",
            Self::MultiVersion => "multi_version",
        }
    }

    pub fn parse(s: &str) -> StateResult<Self> {
        match s {
            "portable" => Ok(Self::Portable),
            "heap" => Ok(Self::Heap),
            "multi_version" => Ok(Self::MultiVersion),
            other => Err(StateError::corrupt(&format!(
                "unknown snapshot format {other:?}"
            ))),
        }
    }
}

/// Reference to previously persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHandle {
    pub id: HandleId,
    pub checkpoint_id: CheckpointId,
    pub kind: HandleKind,
    pub format: SnapshotFormat,
    /// Key groups with a region in this handle. Present iff the kind
    /// is keyed.
    pub key_groups: Option<KeyGroupRange>,
}

impl StateHandle {
    /// A handle over one operator-scoped region.
    pub fn operator(id: &str, checkpoint_id: CheckpointId, kind: HandleKind) -> Self {
        Self {
            id: HandleId(id.to_owned()),
            checkpoint_id,
            kind,
            format: SnapshotFormat::Portable,
            key_groups: None,
        }
    }

    /// A handle with one region per key group in `key_groups`.
    pub fn keyed(
        id: &str,
        checkpoint_id: CheckpointId,
        kind: HandleKind,
        format: SnapshotFormat,
        key_groups: KeyGroupRange,
    ) -> Self {
        Self {
            id: HandleId(id.to_owned()),
            checkpoint_id,
            kind,
            format,
            key_groups: Some(key_groups),
        }
    }

    /// The region holding an operator-scoped handle's bytes.
    pub fn region(&self) -> RegionRef {
        RegionRef {
            handle: self.id.clone(),
            key_group: None,
        }
    }

    /// The region holding one key group of a keyed handle.
    pub fn key_group_region(&self, key_group: KeyGroup) -> RegionRef {
        RegionRef {
            handle: self.id.clone(),
            key_group: Some(key_group),
        }
    }
}

/// Addresses a single persisted byte region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionRef {
    pub handle: HandleId,
    pub key_group: Option<KeyGroup>,
}

impl Display for RegionRef {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self.key_group {
            Some(kg) => write!(fmt, "{}/{kg}", self.handle),
            None => write!(fmt, "{}", self.handle),
        }
    }
}

/// The handles assigned to one task attempt, one ordered set per
/// backend kind.
///
/// All empty means a fresh start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedStateHandles {
    #[serde(default)]
    pub operator: Vec<StateHandle>,
    #[serde(default)]
    pub keyed: Vec<StateHandle>,
    #[serde(default)]
    pub async_keyed: Vec<StateHandle>,
    #[serde(default)]
    pub raw_operator: Vec<StateHandle>,
    #[serde(default)]
    pub raw_keyed: Vec<StateHandle>,
}

impl AssignedStateHandles {
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Every handle in every set.
    pub fn iter(&self) -> impl Iterator<Item = &StateHandle> {
        self.operator
            .iter()
            .chain(self.keyed.iter())
            .chain(self.async_keyed.iter())
            .chain(self.raw_operator.iter())
            .chain(self.raw_keyed.iter())
    }

    /// Sort a flat list of handles into sets by kind.
    ///
    /// Keyed handles in [`SnapshotFormat::MultiVersion`] go to the
    /// async set, all other keyed handles to the sync set.
    pub fn from_handles(handles: impl IntoIterator<Item = StateHandle>) -> Self {
        let mut assigned = Self::default();
        for handle in handles {
            match (handle.kind, handle.format) {
                (HandleKind::Operator, _) => assigned.operator.push(handle),
                (HandleKind::Keyed, SnapshotFormat::MultiVersion) => {
                    assigned.async_keyed.push(handle)
                }
                (HandleKind::Keyed, _) => assigned.keyed.push(handle),
                (HandleKind::RawOperator, _) => assigned.raw_operator.push(handle),
                (HandleKind::RawKeyed, _) => assigned.raw_keyed.push(handle),
            }
        }
        assigned
    }
}

#[test]
fn handle_kind_str_round_trips() {
    for kind in [
        HandleKind::Operator,
        HandleKind::Keyed,
        HandleKind::RawOperator,
        HandleKind::RawKeyed,
    ] {
        assert_eq!(HandleKind::parse(kind.as_str()).unwrap(), kind);
    }
    assert!(HandleKind::parse("nope").is_err());
}

#[test]
fn from_handles_sorts_by_kind_and_format() {
    let range = KeyGroupRange::single(KeyGroup(0));
    let chk = CheckpointId(1);
    let assigned = AssignedStateHandles::from_handles([
        StateHandle::operator("op", chk, HandleKind::Operator),
        StateHandle::keyed("k1", chk, HandleKind::Keyed, SnapshotFormat::Heap, range),
        StateHandle::keyed(
            "k2",
            chk,
            HandleKind::Keyed,
            SnapshotFormat::MultiVersion,
            range,
        ),
        StateHandle::keyed("r", chk, HandleKind::RawKeyed, SnapshotFormat::Portable, range),
    ]);
    assert_eq!(assigned.operator.len(), 1);
    assert_eq!(assigned.keyed.len(), 1);
    assert_eq!(assigned.async_keyed.len(), 1);
    assert_eq!(assigned.raw_operator.len(), 0);
    assert_eq!(assigned.raw_keyed.len(), 1);
    assert!(!assigned.is_empty());
    assert!(AssignedStateHandles::default().is_empty());
}
