use std::io::Read;
use std::sync::Arc;

use operator_state::backend::BackendCapabilities;
use operator_state::backend::BackendSupport;
use operator_state::backend::Closeable;
use operator_state::backend::KeyedMode;
use operator_state::model::*;
use operator_state::raw::PartitionStream;
use operator_state::storage::HandleLease;
use operator_state::storage::InMemStorage;
use operator_state::storage::SnapshotStorage;
use operator_state::storage::SqlitePartition;
use operator_state::storage::StorageConfig;
use operator_state::*;

const MAX_PAR: u32 = 8;

fn task(keyed: bool) -> TaskInfo {
    TaskInfo {
        step_id: StepId("step".to_owned()),
        subtask_index: 0,
        attempt: 1,
        max_parallelism: MAX_PAR,
        key_serializer: keyed.then(|| KeySerializer::new("string", 1)),
    }
}

fn full_range() -> KeyGroupRange {
    KeyGroupRange::new(KeyGroup(0), KeyGroup(MAX_PAR - 1)).unwrap()
}

fn range(start: u32, end: u32) -> KeyGroupRange {
    KeyGroupRange::new(KeyGroup(start), KeyGroup(end)).unwrap()
}

fn sync_only() -> BackendCapabilities {
    BackendCapabilities::sync_only()
}

/// Key group snapshots for every group of `handle`, with `entries`
/// placed in the group their key hashes to.
fn key_group_snapshots(
    handle: &StateHandle,
    entries: &[(&str, &[u8])],
    timers: &[(&str, i64, u64)],
) -> Vec<KeyGroupSnapshot> {
    let handle_range = handle.key_groups.unwrap();
    handle_range
        .iter()
        .map(|kg| {
            let mut snap = KeyGroupSnapshot::new(kg, KeySerializer::new("string", 1));
            for (key, value) in entries {
                let key = StateKey((*key).to_owned());
                if KeyGroup::of(&key, MAX_PAR) == kg {
                    snap.entries.push(StateEntry {
                        state: "count".to_owned(),
                        key,
                        value: StateBytes(value.to_vec()),
                    });
                }
            }
            for (key, timestamp, seq) in timers {
                let key = StateKey((*key).to_owned());
                if KeyGroup::of(&key, MAX_PAR) == kg {
                    snap.timers.push(TimerEntry {
                        service: "window".to_owned(),
                        domain: TimeDomain::EventTime,
                        key,
                        timestamp: *timestamp,
                        seq: *seq,
                    });
                }
            }
            snap
        })
        .collect()
}

fn insert_keyed(storage: &InMemStorage, handle: &StateHandle, entries: &[(&str, &[u8])]) {
    for snap in key_group_snapshots(handle, entries, &[]) {
        storage.insert_key_group(handle, &snap).unwrap();
    }
}

fn raw_operator_handles(storage: &InMemStorage, chk: u64, n: usize) -> Vec<StateHandle> {
    (0..n)
        .map(|i| {
            let handle = StateHandle::operator(
                &format!("raw-{i}"),
                CheckpointId(chk),
                HandleKind::RawOperator,
            );
            storage.insert_region(handle.region(), format!("part {i}").into_bytes());
            handle
        })
        .collect()
}

#[test]
fn fresh_non_keyed_start() {
    let storage = Arc::new(InMemStorage::new());
    let mut ctx = StateContextBuilder::new(storage.clone())
        .build(
            &task(false),
            AssignedStateHandles::default(),
            full_range(),
            &sync_only(),
        )
        .unwrap();

    assert_eq!(ctx.restored_checkpoint_id(), None);
    assert!(!ctx.is_restored());
    assert!(ctx.operator_state_backend().is_empty().unwrap());
    assert!(ctx.key_serializer().is_none());
    assert!(ctx.keyed_state_backend().is_none());
    assert!(ctx.async_keyed_state_backend().is_none());
    assert!(ctx.timer_service_manager().is_none());
    assert!(ctx.async_timer_service_manager().is_none());
    assert!(ctx.raw_keyed_state_inputs().is_none());
    assert_eq!(ctx.raw_operator_state_inputs().iter().count(), 0);
    assert_eq!(storage.stats().opened(), 0);
}

#[test]
fn keyed_task_restores_checkpoint_42_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let chk = CheckpointId(42);
    {
        let part = SqlitePartition::open(&dir.path().join("part-0.sqlite3")).unwrap();

        let op = StateHandle::operator("op-0", chk, HandleKind::Operator);
        let mut op_snap = OperatorSnapshot::new();
        op_snap.lists.push(ListStateEntry {
            name: "offsets".to_owned(),
            distribution: Distribution::SplitDistribute,
            items: vec![StateBytes(vec![7])],
        });
        part.put_handle(&op).unwrap();
        part.put_region(&op.region(), &encode(&op_snap).unwrap()).unwrap();

        let keyed = StateHandle::keyed(
            "keyed-0",
            chk,
            HandleKind::Keyed,
            SnapshotFormat::Heap,
            full_range(),
        );
        part.put_handle(&keyed).unwrap();
        for snap in key_group_snapshots(&keyed, &[("apple", b"3")], &[("apple", 500, 0)]) {
            let region = keyed.key_group_region(snap.key_group);
            part.put_region(&region, &encode(&snap).unwrap()).unwrap();
        }

        // An older checkpoint that must not be picked up.
        let old = StateHandle::operator("op-old", CheckpointId(41), HandleKind::Operator);
        part.put_handle(&old).unwrap();
    }

    let storage = Arc::new(StorageConfig::new(dir.path()).build().unwrap());
    assert_eq!(storage.latest_checkpoint(), Some(chk));
    let handles = storage.handles_for_checkpoint(chk);

    let ctx = StateContextBuilder::new(storage.clone())
        .build(&task(true), handles, full_range(), &sync_only())
        .unwrap();

    assert_eq!(ctx.restored_checkpoint_id(), Some(chk));
    assert!(ctx.is_restored());
    assert_eq!(
        ctx.key_serializer(),
        Some(&KeySerializer::new("string", 1))
    );
    assert!(ctx.async_keyed_state_backend().is_none());
    assert!(ctx.async_timer_service_manager().is_none());

    let backend = ctx.keyed_state_backend().unwrap();
    assert!(backend.is_restored());
    backend.set_current_key(StateKey("apple".to_owned())).unwrap();
    assert_eq!(backend.get("count").unwrap(), Some(StateBytes(b"3".to_vec())));

    let timers = ctx.timer_service_manager().unwrap();
    assert_eq!(timers.num_timers().unwrap(), 1);
    let fired = timers.advance_watermark(500).unwrap();
    assert_eq!(fired[0].key, StateKey("apple".to_owned()));

    assert_eq!(
        ctx.operator_state_backend().list_state("offsets").unwrap(),
        vec![StateBytes(vec![7])]
    );
}

#[test]
fn async_request_on_sync_only_backend_opens_sync() {
    let storage = Arc::new(InMemStorage::new());
    let caps = BackendCapabilities::new(BackendSupport::SyncOnly, KeyedMode::Async);
    let ctx = StateContextBuilder::new(storage)
        .build(&task(true), AssignedStateHandles::default(), full_range(), &caps)
        .unwrap();

    assert!(ctx.keyed_state_backend().is_some());
    assert!(ctx.timer_service_manager().is_some());
    assert!(ctx.async_keyed_state_backend().is_none());
    assert!(ctx.async_timer_service_manager().is_none());
}

#[tokio::test]
async fn async_backend_reads_sync_handles_when_it_has_none() {
    let storage = Arc::new(InMemStorage::new());
    let keyed = StateHandle::keyed(
        "keyed-0",
        CheckpointId(5),
        HandleKind::Keyed,
        SnapshotFormat::Portable,
        full_range(),
    );
    insert_keyed(&storage, &keyed, &[("pear", b"1")]);
    let handles = AssignedStateHandles {
        keyed: vec![keyed],
        ..Default::default()
    };
    let caps = BackendCapabilities::new(BackendSupport::AsyncOnly, KeyedMode::Async);

    let ctx = StateContextBuilder::new(storage)
        .build(&task(true), handles, full_range(), &caps)
        .unwrap();

    assert!(ctx.keyed_state_backend().is_none());
    let backend = ctx.async_keyed_state_backend().unwrap();
    assert!(backend.is_restored());
    let value = backend
        .get("count", &StateKey("pear".to_owned()))
        .await
        .unwrap();
    assert_eq!(value, Some(StateBytes(b"1".to_vec())));
}

#[tokio::test]
async fn both_variants_restore_from_one_shared_portable_set() {
    let storage = Arc::new(InMemStorage::new());
    let keyed = StateHandle::keyed(
        "keyed-0",
        CheckpointId(6),
        HandleKind::Keyed,
        SnapshotFormat::Portable,
        full_range(),
    );
    for snap in key_group_snapshots(&keyed, &[("apple", b"1")], &[("apple", 500, 0)]) {
        storage.insert_key_group(&keyed, &snap).unwrap();
    }
    let handles = AssignedStateHandles {
        keyed: vec![keyed],
        ..Default::default()
    };
    let caps = BackendCapabilities::new(BackendSupport::SyncAndAsync, KeyedMode::Both);

    let ctx = StateContextBuilder::new(storage.clone())
        .build(&task(true), handles, full_range(), &caps)
        .unwrap();

    let apple = StateKey("apple".to_owned());
    let sync_backend = ctx.keyed_state_backend().unwrap();
    sync_backend.set_current_key(apple.clone()).unwrap();
    assert_eq!(
        sync_backend.get("count").unwrap(),
        Some(StateBytes(b"1".to_vec()))
    );
    let async_backend = ctx.async_keyed_state_backend().unwrap();
    assert_eq!(
        async_backend.get("count", &apple).await.unwrap(),
        Some(StateBytes(b"1".to_vec()))
    );
    assert_eq!(ctx.timer_service_manager().unwrap().num_timers().unwrap(), 1);
    assert_eq!(
        ctx.async_timer_service_manager()
            .unwrap()
            .num_timers()
            .unwrap(),
        1
    );
    // Each variant pins the shared handle on its own.
    assert_eq!(storage.stats().live_leases(), 2);

    ctx.into_handles().close().unwrap();
    assert_eq!(storage.stats().live_leases(), 0);
}

#[test]
fn closing_raw_inputs_after_partial_iteration_leaks_nothing() {
    let storage = Arc::new(InMemStorage::new());
    let handles = AssignedStateHandles {
        raw_operator: raw_operator_handles(&storage, 3, 5),
        ..Default::default()
    };
    let mut ctx = StateContextBuilder::new(storage.clone())
        .build(&task(false), handles, full_range(), &sync_only())
        .unwrap();

    let inputs = ctx.raw_operator_state_inputs();
    let mut first = inputs.next_stream().unwrap().unwrap();
    let mut body = String::new();
    first.read_to_string(&mut body).unwrap();
    assert_eq!(body, "part 0");
    let _second = inputs.next_stream().unwrap().unwrap();
    assert_eq!(inputs.remaining(), 3);

    ctx.close_raw_inputs();
    let stats = storage.stats();
    assert_eq!(stats.opened(), 2);
    assert_eq!(stats.closed(), stats.opened());

    let err = ctx.raw_operator_state_inputs().next_stream().err().unwrap();
    assert!(matches!(err, StateError::ResourceAlreadyReleased(_)));
}

#[test]
fn failure_on_third_of_five_opens_closes_what_was_opened() {
    let storage = Arc::new(InMemStorage::new());
    let chk = CheckpointId(9);

    let op = StateHandle::operator("op-0", chk, HandleKind::Operator);
    storage.insert_operator(&op, &OperatorSnapshot::new()).unwrap();
    let sync_keyed = StateHandle::keyed(
        "keyed-sync",
        chk,
        HandleKind::Keyed,
        SnapshotFormat::Portable,
        range(0, 0),
    );
    insert_keyed(&storage, &sync_keyed, &[]);
    let async_keyed = StateHandle::keyed(
        "keyed-async",
        chk,
        HandleKind::Keyed,
        SnapshotFormat::MultiVersion,
        range(1, 3),
    );
    insert_keyed(&storage, &async_keyed, &[]);

    let handles = AssignedStateHandles {
        operator: vec![op],
        keyed: vec![sync_keyed],
        async_keyed: vec![async_keyed],
        ..Default::default()
    };
    let caps = BackendCapabilities::new(BackendSupport::SyncAndAsync, KeyedMode::Both);
    storage.fail_open_at(3);

    let err = StateContextBuilder::new(storage.clone())
        .build(&task(true), handles, range(0, 3), &caps)
        .err()
        .unwrap();

    assert!(matches!(err, StateError::RestoreFailure { .. }), "{err}");
    let stats = storage.stats();
    assert_eq!(stats.opened(), 2);
    assert_eq!(stats.open_streams(), 0);
    assert_eq!(stats.retained(), 3);
    assert_eq!(stats.live_leases(), 0);
}

#[test]
fn raw_keyed_inputs_come_in_key_group_order() {
    let storage = Arc::new(InMemStorage::new());
    let raw_keyed: Vec<_> = [3, 1, 2]
        .into_iter()
        .map(|kg| {
            let handle = StateHandle::keyed(
                &format!("raw-kg-{kg}"),
                CheckpointId(1),
                HandleKind::RawKeyed,
                SnapshotFormat::Portable,
                range(kg, kg),
            );
            storage.insert_region(handle.key_group_region(KeyGroup(kg)), vec![kg as u8]);
            handle
        })
        .collect();
    let handles = AssignedStateHandles {
        raw_keyed,
        ..Default::default()
    };

    let mut ctx = StateContextBuilder::new(storage)
        .build(&task(true), handles, range(1, 3), &sync_only())
        .unwrap();

    let inputs = ctx.raw_keyed_state_inputs().unwrap();
    let mut groups = Vec::new();
    for stream in inputs.iter() {
        let mut stream = stream.unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).unwrap();
        assert_eq!(body, vec![stream.key_group().0 as u8]);
        groups.push(stream.key_group().0);
    }
    assert_eq!(groups, vec![1, 2, 3]);
}

#[test]
fn raw_keyed_gap_is_corrupt() {
    let storage = Arc::new(InMemStorage::new());
    let handles = AssignedStateHandles {
        raw_keyed: vec![StateHandle::keyed(
            "raw-kg",
            CheckpointId(1),
            HandleKind::RawKeyed,
            SnapshotFormat::Portable,
            range(1, 2),
        )],
        ..Default::default()
    };
    let err = StateContextBuilder::new(storage)
        .build(&task(true), handles, range(1, 3), &sync_only())
        .err()
        .unwrap();
    assert!(matches!(err, StateError::CorruptState(_)));
}

#[test]
fn mismatched_checkpoint_ids_are_corrupt() {
    let storage = Arc::new(InMemStorage::new());
    let op = StateHandle::operator("op-0", CheckpointId(1), HandleKind::Operator);
    storage.insert_operator(&op, &OperatorSnapshot::new()).unwrap();
    let mut handles = AssignedStateHandles {
        operator: vec![op],
        ..Default::default()
    };
    handles.raw_operator = raw_operator_handles(&storage, 2, 1);

    let err = StateContextBuilder::new(storage.clone())
        .build(&task(false), handles, full_range(), &sync_only())
        .err()
        .unwrap();
    assert!(matches!(err, StateError::CorruptState(_)));
    assert_eq!(storage.stats().retained(), 0);
}

#[test]
fn non_keyed_task_with_keyed_handles_is_corrupt() {
    let storage = Arc::new(InMemStorage::new());
    let handles = AssignedStateHandles {
        keyed: vec![StateHandle::keyed(
            "keyed-0",
            CheckpointId(1),
            HandleKind::Keyed,
            SnapshotFormat::Heap,
            full_range(),
        )],
        ..Default::default()
    };
    let err = StateContextBuilder::new(storage)
        .build(&task(false), handles, full_range(), &sync_only())
        .err()
        .unwrap();
    assert!(matches!(err, StateError::CorruptState(_)));
}

/// Storage that cancels task startup when the first region is read.
struct CancelOnOpen {
    inner: InMemStorage,
    cancel: CancellationFlag,
}

impl SnapshotStorage for CancelOnOpen {
    fn open_region(&self, region: &RegionRef) -> StateResult<Box<dyn Read + Send>> {
        self.cancel.cancel();
        self.inner.open_region(region)
    }

    fn retain(&self, handle: &HandleId) -> StateResult<HandleLease> {
        self.inner.retain(handle)
    }
}

#[test]
fn cancellation_during_build_closes_opened_backends() {
    let cancel = CancellationFlag::new();
    let inner = InMemStorage::new();
    let op = StateHandle::operator("op-0", CheckpointId(1), HandleKind::Operator);
    inner.insert_operator(&op, &OperatorSnapshot::new()).unwrap();
    let stats = inner.stats();
    let storage = Arc::new(CancelOnOpen {
        inner,
        cancel: cancel.clone(),
    });
    let handles = AssignedStateHandles {
        operator: vec![op],
        ..Default::default()
    };

    let err = StateContextBuilder::new(storage)
        .with_cancellation(cancel)
        .build(&task(true), handles, full_range(), &sync_only())
        .err()
        .unwrap();

    assert!(matches!(err, StateError::Cancelled));
    assert_eq!(stats.retained(), 1);
    assert_eq!(stats.live_leases(), 0);
    assert_eq!(stats.open_streams(), 0);
}

struct ReadsOneRawPartition {
    seen: Vec<u8>,
    held: Option<PartitionStream>,
}

impl StreamOperator for ReadsOneRawPartition {
    fn initialize_state(&mut self, ctx: &mut InitializationContext) -> StateResult<()> {
        if let Some(mut stream) = ctx.raw_operator_state_inputs().next_stream()? {
            stream
                .read_to_end(&mut self.seen)
                .map_err(|err| StateError::exhausted(&err.to_string()))?;
            // Held past initialize; must still be released.
            self.held = ctx.raw_operator_state_inputs().next_stream()?;
        }
        ctx.operator_state_backend()
            .add_to_list("seen", StateBytes(self.seen.clone()))
    }
}

#[test]
fn initialize_operator_closes_raw_inputs_and_hands_over_backends() {
    let storage = Arc::new(InMemStorage::new());
    let handles = AssignedStateHandles {
        raw_operator: raw_operator_handles(&storage, 4, 3),
        ..Default::default()
    };
    let ctx = StateContextBuilder::new(storage.clone())
        .build(&task(true), handles, full_range(), &sync_only())
        .unwrap();

    let mut operator = ReadsOneRawPartition {
        seen: Vec::new(),
        held: None,
    };
    let task_state = initialize_operator(&mut operator, ctx).unwrap();

    assert_eq!(operator.seen, b"part 0".to_vec());
    assert_eq!(storage.stats().opened(), 2);
    assert_eq!(storage.stats().open_streams(), 0);
    assert!(operator.held.as_ref().map_or(false, |held| held.is_closed()));
    assert_eq!(task_state.restored_checkpoint_id, Some(CheckpointId(4)));
    assert!(task_state.keyed_backend.is_some());
    assert!(task_state.timer_service_manager.is_some());
    assert_eq!(
        task_state.operator_backend.list_state("seen").unwrap(),
        vec![StateBytes(b"part 0".to_vec())]
    );

    task_state.close().unwrap();
    assert!(task_state.operator_backend.is_closed());
    assert!(task_state
        .keyed_backend
        .as_ref()
        .map_or(false, |backend| backend.is_closed()));
}
