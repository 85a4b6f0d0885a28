//! Lazy access to raw state partitions.
//!
//! Raw state is bytes an operator wrote itself, without going
//! through a backend. On restore each persisted partition is offered
//! as a readable stream, in order, through a [`CloseableSequence`].
//! Nothing is opened until the consumer asks for the next stream,
//! and closing the sequence releases every stream it handed out,
//! even ones the consumer still holds.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::errors::StateError;
use crate::errors::StateResult;
use crate::model::*;
use crate::storage::SnapshotStorage;

type StreamSlot = Arc<Mutex<Option<Box<dyn Read + Send>>>>;

/// A readable persisted raw region.
///
/// Reads after the stream or its sequence was closed fail.
pub struct PartitionStream {
    region: RegionRef,
    slot: StreamSlot,
}

impl PartitionStream {
    pub fn region(&self) -> &RegionRef {
        &self.region
    }

    /// Release the underlying storage stream.
    pub fn close(&mut self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Read for PartitionStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(reader) => reader.read(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("partition stream {} was released", self.region),
            )),
        }
    }
}

impl Drop for PartitionStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// A raw partition of one key group.
pub struct KeyGroupPartitionStream {
    key_group: KeyGroup,
    stream: PartitionStream,
}

impl KeyGroupPartitionStream {
    pub fn key_group(&self) -> KeyGroup {
        self.key_group
    }

    pub fn region(&self) -> &RegionRef {
        self.stream.region()
    }

    pub fn close(&mut self) {
        self.stream.close();
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}

impl Read for KeyGroupPartitionStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

/// A not-yet-opened element of a [`CloseableSequence`].
pub trait PartitionSource: Send {
    type Stream;

    fn region(&self) -> &RegionRef;

    fn wrap(self, stream: PartitionStream) -> Self::Stream;
}

/// Pending raw operator partition.
pub struct OperatorPartition {
    region: RegionRef,
}

impl PartitionSource for OperatorPartition {
    type Stream = PartitionStream;

    fn region(&self) -> &RegionRef {
        &self.region
    }

    fn wrap(self, stream: PartitionStream) -> PartitionStream {
        stream
    }
}

/// Pending raw keyed partition.
pub struct KeyGroupPartition {
    key_group: KeyGroup,
    region: RegionRef,
}

impl PartitionSource for KeyGroupPartition {
    type Stream = KeyGroupPartitionStream;

    fn region(&self) -> &RegionRef {
        &self.region
    }

    fn wrap(self, stream: PartitionStream) -> KeyGroupPartitionStream {
        KeyGroupPartitionStream {
            key_group: self.key_group,
            stream,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SequenceState {
    Unopened,
    Open,
    Closed,
}

/// Single pass, lazily opened sequence of partition streams.
///
/// Not safe to iterate from one owner while another closes it; the
/// `&mut self` receivers enforce a single owner.
pub struct CloseableSequence<P: PartitionSource> {
    storage: Arc<dyn SnapshotStorage>,
    pending: VecDeque<P>,
    state: SequenceState,
    registry: Vec<StreamSlot>,
}

pub type RawOperatorInputs = CloseableSequence<OperatorPartition>;
pub type RawKeyedInputs = CloseableSequence<KeyGroupPartition>;

impl<P: PartitionSource> CloseableSequence<P> {
    fn new(storage: Arc<dyn SnapshotStorage>, parts: Vec<P>) -> Self {
        Self {
            storage,
            pending: parts.into(),
            state: SequenceState::Unopened,
            registry: Vec::new(),
        }
    }

    /// Open the next partition.
    ///
    /// `Ok(None)` once every partition was handed out. If opening a
    /// partition fails, that partition is skipped and the error
    /// returned; streams handed out before stay valid.
    pub fn next_stream(&mut self) -> StateResult<Option<P::Stream>> {
        if self.state == SequenceState::Closed {
            return Err(StateError::released("raw state sequence is closed"));
        }
        self.state = SequenceState::Open;

        let Some(part) = self.pending.pop_front() else {
            return Ok(None);
        };
        let reader = self.storage.open_region(part.region())?;
        let slot: StreamSlot = Arc::new(Mutex::new(Some(reader)));
        self.registry.push(slot.clone());
        let stream = PartitionStream {
            region: part.region().clone(),
            slot,
        };
        Ok(Some(part.wrap(stream)))
    }

    /// Iterate the remaining partitions.
    ///
    /// Stops after the last partition, or after reporting that the
    /// sequence is closed.
    pub fn iter(&mut self) -> SequenceIter<'_, P> {
        SequenceIter {
            seq: self,
            done: false,
        }
    }

    /// Partitions not handed out yet.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state == SequenceState::Closed
    }

    /// Release every stream opened so far and drop the rest unopened.
    ///
    /// Closing again does nothing.
    pub fn close(&mut self) {
        if self.state == SequenceState::Closed {
            return;
        }
        let released = self
            .registry
            .drain(..)
            .filter(|slot| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .is_some()
            })
            .count();
        let skipped = self.pending.len();
        self.pending.clear();
        self.state = SequenceState::Closed;
        tracing::trace!(
            "Closed raw state sequence; released {released} open streams, skipped {skipped}"
        );
    }
}

impl<P: PartitionSource> Drop for CloseableSequence<P> {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct SequenceIter<'a, P: PartitionSource> {
    seq: &'a mut CloseableSequence<P>,
    done: bool,
}

impl<'a, P: PartitionSource> Iterator for SequenceIter<'a, P> {
    type Item = StateResult<P::Stream>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.seq.next_stream() {
            Ok(Some(stream)) => Some(Ok(stream)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err @ StateError::ResourceAlreadyReleased(_)) => {
                self.done = true;
                Some(Err(err))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

impl<'a, P: PartitionSource> std::iter::FusedIterator for SequenceIter<'a, P> {}

/// One partition per raw operator handle, in handle order.
pub(crate) fn raw_operator_inputs(
    storage: Arc<dyn SnapshotStorage>,
    handles: &[StateHandle],
) -> RawOperatorInputs {
    let parts = handles
        .iter()
        .map(|handle| OperatorPartition {
            region: handle.region(),
        })
        .collect();
    CloseableSequence::new(storage, parts)
}

/// One partition per key group, ascending.
///
/// A non-empty handle set must cover `range` exactly once; gaps,
/// overlaps and key groups outside the range are corrupt.
pub(crate) fn raw_keyed_inputs(
    storage: Arc<dyn SnapshotStorage>,
    handles: &[StateHandle],
    range: KeyGroupRange,
) -> StateResult<RawKeyedInputs> {
    let mut parts = Vec::new();
    for handle in handles {
        let handle_range = handle.key_groups.ok_or_else(|| {
            StateError::corrupt(&format!("raw keyed handle {} has no key groups", handle.id))
        })?;
        if !range.contains(handle_range.start()) || !range.contains(handle_range.end()) {
            return Err(StateError::corrupt(&format!(
                "raw keyed handle {} covers {handle_range}, outside assigned range {range}",
                handle.id
            )));
        }
        parts.extend(handle_range.iter().map(|key_group| KeyGroupPartition {
            key_group,
            region: handle.key_group_region(key_group),
        }));
    }
    parts.sort_by_key(|part| part.key_group);

    if !parts.is_empty() {
        let mut expected = range.iter();
        for part in &parts {
            match expected.next() {
                Some(kg) if kg == part.key_group => {}
                Some(kg) if part.key_group < kg => {
                    return Err(StateError::corrupt(&format!(
                        "raw keyed {} is covered twice or is outside assigned range {range}",
                        part.key_group
                    )));
                }
                Some(kg) => {
                    return Err(StateError::corrupt(&format!(
                        "raw keyed state has a gap at {kg} in assigned range {range}"
                    )));
                }
                None => {
                    return Err(StateError::corrupt(&format!(
                        "raw keyed {} is outside assigned range {range}",
                        part.key_group
                    )));
                }
            }
        }
        if let Some(kg) = expected.next() {
            return Err(StateError::corrupt(&format!(
                "raw keyed state has a gap at {kg} in assigned range {range}"
            )));
        }
    }
    Ok(CloseableSequence::new(storage, parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemStorage;

    fn raw_handle(storage: &InMemStorage, id: &str, body: &[u8]) -> StateHandle {
        let handle = StateHandle::operator(id, CheckpointId(1), HandleKind::RawOperator);
        storage.insert_region(handle.region(), body.to_vec());
        handle
    }

    fn keyed_handle(storage: &InMemStorage, id: &str, kg: u32) -> StateHandle {
        let range = KeyGroupRange::single(KeyGroup(kg));
        let handle = StateHandle::keyed(
            id,
            CheckpointId(1),
            HandleKind::RawKeyed,
            SnapshotFormat::Portable,
            range,
        );
        storage.insert_region(handle.key_group_region(KeyGroup(kg)), vec![kg as u8]);
        handle
    }

    #[test]
    fn empty_sequence_yields_nothing() {
        let storage = Arc::new(InMemStorage::new());
        let mut seq = raw_operator_inputs(storage.clone(), &[]);
        assert_eq!(seq.iter().count(), 0);
        assert_eq!(storage.stats().opened(), 0);
    }

    #[test]
    fn opens_lazily_and_reads() {
        let storage = Arc::new(InMemStorage::new());
        let handles = vec![
            raw_handle(&storage, "raw-0", b"abc"),
            raw_handle(&storage, "raw-1", b"de"),
        ];
        let mut seq = raw_operator_inputs(storage.clone(), &handles);
        assert_eq!(storage.stats().opened(), 0);

        let mut bodies = Vec::new();
        for stream in seq.iter() {
            let mut stream = stream.unwrap();
            let mut body = String::new();
            stream.read_to_string(&mut body).unwrap();
            bodies.push(body);
        }
        assert_eq!(bodies, vec!["abc".to_owned(), "de".to_owned()]);
        assert_eq!(storage.stats().open_streams(), 0);
    }

    #[test]
    fn close_after_partial_iteration_releases_held_streams() {
        let storage = Arc::new(InMemStorage::new());
        let handles: Vec<_> = (0..4)
            .map(|i| raw_handle(&storage, &format!("raw-{i}"), b"x"))
            .collect();
        let mut seq = raw_operator_inputs(storage.clone(), &handles);

        let mut first = seq.next_stream().unwrap().unwrap();
        let _second = seq.next_stream().unwrap().unwrap();
        assert_eq!(storage.stats().open_streams(), 2);

        seq.close();
        assert_eq!(storage.stats().opened(), 2);
        assert_eq!(storage.stats().closed(), 2);
        assert!(first.is_closed());
        assert!(first.read(&mut [0; 1]).is_err());

        let err = seq.next_stream().err().unwrap();
        assert!(matches!(err, StateError::ResourceAlreadyReleased(_)));
        let items: Vec<_> = seq.iter().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(StateError::ResourceAlreadyReleased(_))
        ));
    }

    #[test]
    fn failed_element_does_not_stop_the_rest() {
        let storage = Arc::new(InMemStorage::new());
        let handles: Vec<_> = (0..3)
            .map(|i| raw_handle(&storage, &format!("raw-{i}"), b"x"))
            .collect();
        let mut seq = raw_operator_inputs(storage.clone(), &handles);
        storage.fail_open_at(2);

        let results: Vec<_> = seq.iter().map(|stream| stream.is_ok()).collect();
        assert_eq!(results, vec![true, false, true]);
        drop(seq);
        assert_eq!(storage.stats().open_streams(), 0);
    }

    #[test]
    fn keyed_partitions_come_in_key_group_order() {
        let storage = Arc::new(InMemStorage::new());
        let handles = vec![
            keyed_handle(&storage, "raw-3", 3),
            keyed_handle(&storage, "raw-1", 1),
            keyed_handle(&storage, "raw-2", 2),
        ];
        let range = KeyGroupRange::new(KeyGroup(1), KeyGroup(3)).unwrap();
        let mut seq = raw_keyed_inputs(storage.clone(), &handles, range).unwrap();

        let groups: Vec<_> = seq
            .iter()
            .map(|stream| stream.unwrap().key_group().0)
            .collect();
        assert_eq!(groups, vec![1, 2, 3]);
    }

    #[test]
    fn keyed_partitions_must_tile_range() {
        let storage = Arc::new(InMemStorage::new());
        let range = KeyGroupRange::new(KeyGroup(1), KeyGroup(3)).unwrap();

        let gap = vec![
            keyed_handle(&storage, "raw-1", 1),
            keyed_handle(&storage, "raw-3", 3),
        ];
        let err = raw_keyed_inputs(storage.clone(), &gap, range).err().unwrap();
        assert!(matches!(err, StateError::CorruptState(_)));

        let outside = vec![
            keyed_handle(&storage, "raw-1", 1),
            keyed_handle(&storage, "raw-2", 2),
            keyed_handle(&storage, "raw-3", 3),
            keyed_handle(&storage, "raw-4", 4),
        ];
        let err = raw_keyed_inputs(storage.clone(), &outside, range)
            .err()
            .unwrap();
        assert!(matches!(err, StateError::CorruptState(_)));

        let overlap = vec![
            keyed_handle(&storage, "raw-1", 1),
            keyed_handle(&storage, "raw-1b", 1),
            keyed_handle(&storage, "raw-2", 2),
            keyed_handle(&storage, "raw-3", 3),
        ];
        let err = raw_keyed_inputs(storage.clone(), &overlap, range)
            .err()
            .unwrap();
        assert!(matches!(err, StateError::CorruptState(_)));

        let missing_tail = vec![keyed_handle(&storage, "raw-1", 1)];
        let err = raw_keyed_inputs(storage, &missing_tail, range)
            .err()
            .unwrap();
        assert!(matches!(err, StateError::CorruptState(_)));
    }

    #[test]
    fn keyed_handle_wider_than_range_is_rejected_up_front() {
        let storage = Arc::new(InMemStorage::new());
        let range = KeyGroupRange::new(KeyGroup(0), KeyGroup(3)).unwrap();
        let everything = StateHandle::keyed(
            "raw-all",
            CheckpointId(1),
            HandleKind::RawKeyed,
            SnapshotFormat::Portable,
            KeyGroupRange::new(KeyGroup(0), KeyGroup(u32::MAX)).unwrap(),
        );
        let err = raw_keyed_inputs(storage.clone(), &[everything], range)
            .err()
            .unwrap();
        assert!(matches!(err, StateError::CorruptState(_)));
        assert_eq!(storage.stats().opened(), 0);
    }
}
