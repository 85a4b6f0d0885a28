//! SQLite implementation of snapshot storage.
//!
//! Persisted state lives in a directory of partition files, each an
//! SQLite DB ending in `.sqlite3`. A handle and all of its regions
//! live in the same partition, but which partition is only known by
//! looking, so [`StorageConfig::build`] opens every partition up
//! front and indexes handle ids to partitions.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::Cursor;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use serde::Deserialize;
use serde::Serialize;
use tracing::instrument;

use super::HandleLease;
use super::SnapshotStorage;
use crate::errors::ErrorContext;
use crate::errors::StateError;
use crate::errors::StateResult;
use crate::model::*;

/// Configuration settings for snapshot storage.
///
/// `db_dir` is the local filesystem directory to search for snapshot
/// partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_dir: PathBuf,
}

impl StorageConfig {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
        }
    }

    /// Open every partition in the directory.
    #[instrument(name = "build_storage", skip_all)]
    pub fn build(&self) -> StateResult<SqliteSnapshotStorage> {
        let sqlite_ext = OsStr::new("sqlite3");
        let mut parts = Vec::new();
        for entry in fs::read_dir(&self.db_dir).or_exhausted("Error listing snapshot DB dir")? {
            let path = entry.or_exhausted("Error accessing snapshot DB file")?.path();
            if path.extension().map_or(false, |ext| *ext == *sqlite_ext) {
                parts.push(SqlitePartition::open(&path)?);
            }
        }
        // Directory order is not stable; keep lookups deterministic.
        parts.sort_by(|a, b| a.path.cmp(&b.path));
        SqliteSnapshotStorage::from_partitions(parts)
    }
}

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![
            M::up(
                "CREATE TABLE handles ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 handle_id TEXT NOT NULL PRIMARY KEY, \
                 checkpoint_id INTEGER NOT NULL CHECK (checkpoint_id >= 0), \
                 kind TEXT NOT NULL, \
                 format TEXT NOT NULL, \
                 kg_start INTEGER CHECK (kg_start >= 0), \
                 kg_end INTEGER, \
                 CHECK ((kg_start IS NULL) = (kg_end IS NULL)), \
                 CHECK (kg_start <= kg_end) \
                 ) STRICT",
            ),
            // Operator-scoped regions use key group -1 so the primary
            // key never contains a NULL.
            M::up(
                "CREATE TABLE regions ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 handle_id TEXT NOT NULL REFERENCES handles (handle_id), \
                 key_group INTEGER NOT NULL CHECK (key_group >= -1), \
                 bytes BLOB NOT NULL, \
                 PRIMARY KEY (handle_id, key_group) \
                 ) STRICT",
            ),
            M::up("CREATE INDEX handles_by_checkpoint ON handles (checkpoint_id)"),
        ])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> StateResult<()> {
    conn.pragma_update(None, "foreign_keys", "ON")
        .or_exhausted("Error enabling foreign keys")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .or_exhausted("Error setting journal mode")?;
    conn.pragma_update(None, "busy_timeout", "5000")
        .or_exhausted("Error setting busy timeout")?;
    get_migrations()
        .to_latest(conn)
        .or_exhausted("Error migrating snapshot DB")?;
    Ok(())
}

fn key_group_column(key_group: Option<KeyGroup>) -> i64 {
    key_group.map_or(-1, |kg| i64::from(kg.0))
}

type HandleRow = (String, u64, String, String, Option<u32>, Option<u32>);

fn handle_from_row(row: HandleRow) -> StateResult<StateHandle> {
    let (id, checkpoint_id, kind, format, kg_start, kg_end) = row;
    let key_groups = match (kg_start, kg_end) {
        (Some(start), Some(end)) => Some(KeyGroupRange::new(KeyGroup(start), KeyGroup(end))?),
        (None, None) => None,
        _ => {
            return Err(StateError::corrupt(&format!(
                "handle {id} has a half-open key group range"
            )))
        }
    };
    Ok(StateHandle {
        id: HandleId(id),
        checkpoint_id: CheckpointId(checkpoint_id),
        kind: HandleKind::parse(&kind)?,
        format: SnapshotFormat::parse(&format)?,
        key_groups,
    })
}

/// One partition file.
pub struct SqlitePartition {
    path: PathBuf,
    /// [`Connection`] is not `Sync`; storage is shared between
    /// threads.
    conn: Mutex<Connection>,
}

impl SqlitePartition {
    /// Open a partition, creating it if it does not exist.
    pub fn open(path: &Path) -> StateResult<Self> {
        tracing::debug!("Opening snapshot partition at {path:?}");
        let mut conn = Connection::open(path).or_exhausted("Error opening snapshot DB file")?;
        setup_conn(&mut conn)?;
        Ok(Self {
            path: path.to_owned(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a handle. Regions are added with [`Self::put_region`].
    pub fn put_handle(&self, handle: &StateHandle) -> StateResult<()> {
        tracing::trace!("Writing {handle:?}");
        let (kg_start, kg_end) = handle
            .key_groups
            .map(|range| (range.start().0, range.end().0))
            .unzip();
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let txn = conn.transaction().or_exhausted("Error starting txn")?;
        txn.execute(
            "INSERT INTO handles (handle_id, checkpoint_id, kind, format, kg_start, kg_end) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &handle.id.0,
                handle.checkpoint_id.0,
                handle.kind.as_str(),
                handle.format.as_str(),
                kg_start,
                kg_end,
            ),
        )
        .or_exhausted("Error writing handle")?;
        txn.commit().or_exhausted("Error committing handle")
    }

    /// Write the bytes of one region. The region's handle must
    /// already be recorded.
    pub fn put_region(&self, region: &RegionRef, bytes: &[u8]) -> StateResult<()> {
        tracing::trace!("Writing region {region}");
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let txn = conn.transaction().or_exhausted("Error starting txn")?;
        txn.execute(
            "INSERT INTO regions (handle_id, key_group, bytes) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (handle_id, key_group) DO UPDATE \
             SET bytes = EXCLUDED.bytes",
            (&region.handle.0, key_group_column(region.key_group), bytes),
        )
        .or_exhausted("Error writing region")?;
        txn.commit().or_exhausted("Error committing region")
    }

    /// Every handle recorded in this partition.
    pub fn handles(&self) -> StateResult<Vec<StateHandle>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = conn
            .prepare(
                "SELECT handle_id, checkpoint_id, kind, format, kg_start, kg_end \
                 FROM handles \
                 ORDER BY checkpoint_id, handle_id",
            )
            .or_exhausted("Error preparing handle query")?
            .query_map((), |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })
            .or_exhausted("Error querying handles")?
            // Handle metadata is "small" so it's ok to load it all
            // into memory.
            .collect::<Result<Vec<HandleRow>, _>>()
            .or_exhausted("Error unpacking handle row")?;
        rows.into_iter().map(handle_from_row).collect()
    }

    fn read_region(&self, region: &RegionRef) -> StateResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row(
            "SELECT bytes FROM regions WHERE handle_id = ?1 AND key_group = ?2",
            (&region.handle.0, key_group_column(region.key_group)),
            |row| row.get(0),
        )
        .optional()
        .or_exhausted(&format!("Error reading region {region}"))
    }
}

/// Snapshot storage over a set of SQLite partitions.
pub struct SqliteSnapshotStorage {
    parts: Vec<SqlitePartition>,
    /// Which partition each known handle lives in, and its metadata.
    index: HashMap<HandleId, (usize, StateHandle)>,
}

impl SqliteSnapshotStorage {
    pub fn from_partitions(parts: Vec<SqlitePartition>) -> StateResult<Self> {
        let mut index = HashMap::new();
        for (ix, part) in parts.iter().enumerate() {
            for handle in part.handles()? {
                tracing::info!("Access to handle {} at {:?}", handle.id, part.path);
                if let Some((other, _)) = index.insert(handle.id.clone(), (ix, handle.clone())) {
                    return Err(StateError::corrupt(&format!(
                        "handle {} is in both {:?} and {:?}",
                        handle.id, parts[other].path, part.path
                    )));
                }
            }
        }
        Ok(Self { parts, index })
    }

    /// Every known handle, oldest checkpoint first.
    pub fn handles(&self) -> Vec<StateHandle> {
        let mut handles: Vec<_> = self.index.values().map(|(_, h)| h.clone()).collect();
        handles.sort_by(|a, b| (a.checkpoint_id, &a.id).cmp(&(b.checkpoint_id, &b.id)));
        handles
    }

    /// The newest checkpoint with any state in storage.
    pub fn latest_checkpoint(&self) -> Option<CheckpointId> {
        self.index.values().map(|(_, h)| h.checkpoint_id).max()
    }

    /// All handles of one checkpoint, sorted into sets by kind.
    pub fn handles_for_checkpoint(&self, checkpoint_id: CheckpointId) -> AssignedStateHandles {
        AssignedStateHandles::from_handles(
            self.handles()
                .into_iter()
                .filter(|h| h.checkpoint_id == checkpoint_id),
        )
    }
}

impl SnapshotStorage for SqliteSnapshotStorage {
    fn open_region(&self, region: &RegionRef) -> StateResult<Box<dyn Read + Send>> {
        let (ix, _) = self
            .index
            .get(&region.handle)
            .ok_or_else(|| StateError::exhausted(&format!("no partition holds {region}")))?;
        let bytes = self.parts[*ix]
            .read_region(region)?
            .ok_or_else(|| StateError::exhausted(&format!("region {region} is missing")))?;
        tracing::trace!("Opened region {region} ({} bytes)", bytes.len());
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn retain(&self, handle: &HandleId) -> StateResult<HandleLease> {
        if self.index.contains_key(handle) {
            Ok(HandleLease::new(handle.clone()))
        } else {
            Err(StateError::restore_failure(&format!(
                "handle {handle} is missing from storage"
            )))
        }
    }
}
