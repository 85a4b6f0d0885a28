//! Payloads stored in persisted regions.
//!
//! Each keyed region holds one [`KeyGroupSnapshot`] and each operator
//! region one [`OperatorSnapshot`], JSON encoded. Timers live next to
//! the keyed entries of the same key group so a timer manager is
//! always restored from exactly the handles its keyed backend is.

use std::collections::BTreeMap;
use std::io::Read;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use super::KeyGroup;
use super::KeySerializer;
use super::RegionRef;
use super::StateBytes;
use super::StateKey;
use crate::errors::ErrorContext;
use crate::errors::StateError;
use crate::errors::StateResult;

/// Newest payload version this crate can read.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// One value of a named keyed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: String,
    pub key: StateKey,
    pub value: StateBytes,
}

/// Which clock a timer fires on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeDomain {
    EventTime,
    ProcessingTime,
}

/// A registered timer as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEntry {
    /// Name of the timer service the timer was registered on.
    pub service: String,
    pub domain: TimeDomain,
    pub key: StateKey,
    /// Milliseconds; event time for event timers, UNIX epoch millis
    /// for processing timers.
    pub timestamp: i64,
    /// Registration order, breaks ties between equal timestamps.
    pub seq: u64,
}

/// Contents of one key group of a keyed handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGroupSnapshot {
    pub format_version: u32,
    pub key_group: KeyGroup,
    pub key_serializer: KeySerializer,
    #[serde(default)]
    pub entries: Vec<StateEntry>,
    #[serde(default)]
    pub timers: Vec<TimerEntry>,
}

impl KeyGroupSnapshot {
    pub fn new(key_group: KeyGroup, key_serializer: KeySerializer) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            key_group,
            key_serializer,
            entries: Vec::new(),
            timers: Vec::new(),
        }
    }
}

/// How list state is redistributed when parallelism changes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Each task gets a share of the items.
    SplitDistribute,
    /// Each task gets every item.
    Union,
}

/// One named list state of an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListStateEntry {
    pub name: String,
    pub distribution: Distribution,
    pub items: Vec<StateBytes>,
}

/// Contents of one operator-scoped handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSnapshot {
    pub format_version: u32,
    #[serde(default)]
    pub lists: Vec<ListStateEntry>,
    /// Broadcast map states by name. Identical on every task.
    #[serde(default)]
    pub broadcast: BTreeMap<String, BTreeMap<String, StateBytes>>,
}

impl OperatorSnapshot {
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            ..Default::default()
        }
    }
}

/// Payloads that carry a format version.
pub trait Versioned {
    fn format_version(&self) -> u32;
}

impl Versioned for KeyGroupSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}

impl Versioned for OperatorSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}

/// Encode a payload for storage.
pub fn encode<T: Serialize>(payload: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(payload).or_restore_failure("Error encoding snapshot payload")
}

/// Read a region to its end and decode it.
pub fn decode<T>(mut reader: impl Read, region: &RegionRef) -> StateResult<T>
where
    T: DeserializeOwned + Versioned,
{
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .or_exhausted(&format!("Error reading region {region}"))?;
    let payload: T = serde_json::from_slice(&buf)
        .or_restore_failure(&format!("Error decoding region {region}"))?;
    let version = payload.format_version();
    if version == 0 || version > SNAPSHOT_FORMAT_VERSION {
        return Err(StateError::restore_failure(&format!(
            "region {region} has format version {version}; \
             only 1..={SNAPSHOT_FORMAT_VERSION} can be read"
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HandleId;

    fn region() -> RegionRef {
        RegionRef {
            handle: HandleId("h".to_owned()),
            key_group: Some(KeyGroup(2)),
        }
    }

    #[test]
    fn decode_reads_encoded_key_group() {
        let mut snap = KeyGroupSnapshot::new(KeyGroup(2), KeySerializer::new("string", 1));
        snap.entries.push(StateEntry {
            state: "count".to_owned(),
            key: StateKey("a".to_owned()),
            value: StateBytes(vec![1]),
        });
        let bytes = encode(&snap).unwrap();
        let found: KeyGroupSnapshot = decode(bytes.as_slice(), &region()).unwrap();
        assert_eq!(found, snap);
    }

    #[test]
    fn decode_rejects_future_versions() {
        let mut snap = OperatorSnapshot::new();
        snap.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let bytes = encode(&snap).unwrap();
        let err = decode::<OperatorSnapshot>(bytes.as_slice(), &region()).unwrap_err();
        assert!(matches!(err, StateError::RestoreFailure { .. }));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode::<OperatorSnapshot>(&b"{{{"[..], &region()).unwrap_err();
        assert!(matches!(err, StateError::RestoreFailure { .. }));
    }
}
