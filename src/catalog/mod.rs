//! # Local Catalog
//!
//! The embedded relational store of record: interned blocks and blocksets,
//! files, filesets, and the remote-volume lifecycle table (spec.md §4.3).
//! Built on `rusqlite` with a bundled SQLite, the same way `b2_backup`'s
//! manifest store works, generalized from a single JSON-snapshot table to
//! the full normalized schema this design calls for.
//!
//! Catalog access happens from a single orchestrating context (spec.md §5):
//! no internal locking beyond the advisory file lock taken at [`Catalog::open`]
//! time to stop two processes from touching the same catalog file at once.

mod schema;

use crate::error::{CatalogStateError, CoreError, InvariantError, Result};
use crate::model::{Block, Blockset, BlockRef, FileKind, FileRecord, Fileset, FilesetEntry, RemoteVolume, VolumeKind, VolumeState};
use crate::object_store::{FlushHook, QueueOp};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A catalog shared between the orchestrating engine code and the upload
/// queue's flush hook. The hook only ever locks it for the duration of a
/// single state-transition update, never across an `.await`.
pub type SharedCatalog = Arc<Mutex<Catalog>>;

/// Builds the flush hook described in spec.md §4.1: invoked on the queue's
/// worker immediately before an upload begins, it promotes the matching
/// remote-volume row from `temporary` to `uploading` atomically with the
/// upload attempt.
pub fn flush_hook(catalog: SharedCatalog) -> FlushHook {
    Arc::new(move |op| {
        if let QueueOp::Upload { name } = op {
            let cat = match catalog.lock() {
                Ok(cat) => cat,
                Err(_) => return,
            };
            if let Ok(Some(id)) = cat.find_remote_volume_by_name(name) {
                let _ = cat.update_remote_volume(id, VolumeState::Uploading, None);
            }
        }
    })
}

/// A fileset under construction, not yet durable. Held in memory and handed
/// to [`Catalog::write_fileset`] as a single transaction once a backup run
/// finishes chunking and interning every file (an in-process stand-in for a
/// SQL scratch table, since there is only ever one writer at a time).
pub struct TempFileset {
    pub timestamp: DateTime<Utc>,
    pub is_full_backup: bool,
    pub entries: Vec<TempFilesetEntry>,
}

pub struct TempFilesetEntry {
    pub path: String,
    pub kind: FileKind,
    pub content_blockset_id: Option<i64>,
    pub metadata_blockset_id: Option<i64>,
    pub modified: DateTime<Utc>,
    pub lastmodified: bool,
}

impl TempFileset {
    pub fn push(&mut self, entry: TempFilesetEntry) {
        self.entries.push(entry);
    }
}

/// The local catalog database, plus an advisory lock on the backing file.
pub struct Catalog {
    conn: Connection,
    _lock: Option<File>,
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut p = db_path.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

fn acquire_lock(db_path: &Path) -> Result<Option<File>> {
    if db_path == Path::new(":memory:") {
        return Ok(None);
    }
    let lock_file = File::create(lock_path(db_path))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| CatalogStateError::Locked(db_path.to_path_buf()))?;
    Ok(Some(lock_file))
}

impl Catalog {
    /// Opens (creating if absent) the catalog at `path`, applying the schema
    /// and checking its `user_version` against [`schema::CURRENT_SCHEMA_VERSION`].
    pub fn open(path: &Path) -> Result<Self> {
        let lock = acquire_lock(path)?;
        let conn = Connection::open(path)?;
        Self::init(conn, lock)
    }

    /// An in-memory catalog, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, lock: Option<File>) -> Result<Self> {
        conn.execute_batch(schema::SCHEMA_SQL)?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version == 0 {
            conn.pragma_update(None, "user_version", schema::CURRENT_SCHEMA_VERSION)?;
        } else if version > schema::CURRENT_SCHEMA_VERSION {
            return Err(anyhow::anyhow!(
                "catalog schema version {version} is newer than this build supports ({})",
                schema::CURRENT_SCHEMA_VERSION
            )
            .into());
        }
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Catalog { conn, _lock: lock })
    }

    // ─── Blocks ─────────────────────────────────────────────────────────────

    /// Interns a content block, returning its id. A `(hash, size)` collision
    /// with a different recorded size is an invariant violation (P1).
    pub fn intern_block(&self, hash: &str, size: u64) -> Result<i64> {
        if let Some(existing) = self.find_block(hash)? {
            if existing.size != size {
                return Err(InvariantError::BlockHashSizeCollision {
                    hash: hash.to_string(),
                    size,
                }
                .into());
            }
            return Ok(existing.id);
        }
        self.conn.execute(
            "INSERT INTO block (hash, size, volume_id) VALUES (?1, ?2, NULL)",
            params![hash, size as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_block(&self, hash: &str) -> Result<Option<Block>> {
        self.conn
            .query_row(
                "SELECT id, hash, size FROM block WHERE hash = ?1",
                params![hash],
                |r| {
                    Ok(Block {
                        id: r.get(0)?,
                        hash: r.get(1)?,
                        size: r.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()
            .map_err(CoreError::from)
    }

    /// Records which remote volume a block's data physically lives in, once
    /// its dblock volume has been built.
    pub fn set_block_volume(&self, block_id: i64, volume_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE block SET volume_id = ?1 WHERE id = ?2",
            params![volume_id, block_id],
        )?;
        Ok(())
    }

    /// The dblock volume a block's bytes physically live in, if it has been
    /// uploaded at all. `None` if the block was interned but never attached
    /// to a volume (should not happen once a backup run completes).
    pub fn block_volume(&self, block_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT volume_id FROM block WHERE id = ?1", params![block_id], |r| r.get(0))
            .optional()
            .map_err(CoreError::from)
    }

    // ─── Blocksets ──────────────────────────────────────────────────────────

    /// Interns a blockset (an ordered list of already-interned blocks),
    /// returning its id. Blocksets are content-addressed by `full_hash`, so
    /// identical content across files or versions is stored once.
    pub fn intern_blockset(&self, full_hash: &str, length: u64, block_ids: &[(i64, String, u64)]) -> Result<i64> {
        if let Some(id) = self
            .conn
            .query_row(
                "SELECT id FROM blockset WHERE full_hash = ?1 AND length = ?2",
                params![full_hash, length as i64],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok(id);
        }

        self.conn.execute(
            "INSERT INTO blockset (length, full_hash) VALUES (?1, ?2)",
            params![length as i64, full_hash],
        )?;
        let blockset_id = self.conn.last_insert_rowid();
        for (ordinal, (block_id, _hash, _size)) in block_ids.iter().enumerate() {
            self.conn.execute(
                "INSERT INTO blockset_entry (blockset_id, ordinal, block_id) VALUES (?1, ?2, ?3)",
                params![blockset_id, ordinal as i64, block_id],
            )?;
        }
        Ok(blockset_id)
    }

    pub fn get_blockset(&self, id: i64) -> Result<Option<Blockset>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, length, full_hash FROM blockset WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, i64>(1)? as u64,
                        r.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, length, full_hash)) = row else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT be.ordinal, be.block_id, b.hash, b.size
             FROM blockset_entry be JOIN block b ON b.id = be.block_id
             WHERE be.blockset_id = ?1 ORDER BY be.ordinal",
        )?;
        let blocks = stmt
            .query_map(params![id], |r| {
                Ok(BlockRef {
                    ordinal: r.get(0)?,
                    block_id: r.get(1)?,
                    hash: r.get(2)?,
                    size: r.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(Blockset { id, length, full_hash, blocks }))
    }

    // ─── Files & filesets ───────────────────────────────────────────────────

    /// Begins an in-memory fileset for a new backup run.
    pub fn create_temporary_fileset(&self, timestamp: DateTime<Utc>, is_full_backup: bool) -> Result<TempFileset> {
        if let Some(existing) = self.fileset_times()?.into_iter().max() {
            if timestamp <= existing {
                return Err(InvariantError::NonMonotonicFileset(timestamp, existing).into());
            }
        }
        Ok(TempFileset {
            timestamp,
            is_full_backup,
            entries: Vec::new(),
        })
    }

    /// Commits a finished [`TempFileset`] to durable storage in one
    /// transaction. Every referenced file identity is interned (reusing rows
    /// for unchanged content), then the fileset and its membership rows are
    /// written. `remote_volume_id` is attached later via
    /// [`Catalog::attach_fileset_volume`], once the dfileset volume exists.
    pub fn write_fileset(&mut self, temp: TempFileset) -> Result<i64> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO fileset (timestamp, is_full_backup, remote_volume_id) VALUES (?1, ?2, NULL)",
            params![temp.timestamp.to_rfc3339(), temp.is_full_backup as i64],
        )?;
        let fileset_id = tx.last_insert_rowid();

        for entry in &temp.entries {
            let file_id: i64 = tx
                .query_row(
                    "SELECT id FROM file WHERE path = ?1
                     AND COALESCE(content_blockset_id, -1) = COALESCE(?2, -1)
                     AND COALESCE(metadata_blockset_id, -1) = COALESCE(?3, -1)",
                    params![entry.path, entry.content_blockset_id, entry.metadata_blockset_id],
                    |r| r.get(0),
                )
                .optional()?
                .map(Ok)
                .unwrap_or_else(|| -> rusqlite::Result<i64> {
                    tx.execute(
                        "INSERT INTO file (path, kind, content_blockset_id, metadata_blockset_id)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            entry.path,
                            entry.kind.to_string(),
                            entry.content_blockset_id,
                            entry.metadata_blockset_id
                        ],
                    )?;
                    Ok(tx.last_insert_rowid())
                })?;

            tx.execute(
                "INSERT INTO fileset_entry (fileset_id, file_id, modified, lastmodified) VALUES (?1, ?2, ?3, ?4)",
                params![fileset_id, file_id, entry.modified.to_rfc3339(), entry.lastmodified as i64],
            )?;
        }

        tx.commit()?;
        Ok(fileset_id)
    }

    pub fn attach_fileset_volume(&self, fileset_id: i64, remote_volume_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE fileset SET remote_volume_id = ?1 WHERE id = ?2",
            params![remote_volume_id, fileset_id],
        )?;
        Ok(())
    }

    /// All fileset ids, oldest first.
    pub fn get_fileset_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM fileset ORDER BY timestamp ASC")?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Timestamps of every fileset, oldest first — used to enforce monotonicity (P4).
    pub fn fileset_times(&self) -> Result<Vec<DateTime<Utc>>> {
        let mut stmt = self.conn.prepare("SELECT timestamp FROM fileset ORDER BY timestamp ASC")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| anyhow::anyhow!("malformed fileset timestamp '{s}': {e}").into())
            })
            .collect()
    }

    /// Finds a timestamp for a rewritten fileset that is strictly after `t0`,
    /// collides with no existing fileset, and (if given) strictly precedes
    /// `t_next` — the next-newer fileset's timestamp (spec.md §4.5 step 2).
    pub fn probe_new_fileset_timestamp(
        &self,
        t0: DateTime<Utc>,
        t_next: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>> {
        let existing: std::collections::HashSet<DateTime<Utc>> = self.fileset_times()?.into_iter().collect();
        let mut candidate = t0 + chrono::Duration::seconds(1);
        loop {
            if let Some(next) = t_next {
                if candidate >= next {
                    return Err(InvariantError::TimestampCollision { candidate, next_newer: next }.into());
                }
            }
            if !existing.contains(&candidate) {
                return Ok(candidate);
            }
            candidate += chrono::Duration::seconds(1);
        }
    }

    pub fn get_fileset(&self, id: i64) -> Result<Option<Fileset>> {
        self.conn
            .query_row(
                "SELECT id, timestamp, is_full_backup, remote_volume_id FROM fileset WHERE id = ?1",
                params![id],
                |r| {
                    let ts: String = r.get(1)?;
                    Ok((ts, r.get::<_, i64>(0)?, r.get::<_, i64>(2)?, r.get::<_, Option<i64>>(3)?))
                },
            )
            .optional()?
            .map(|(ts, id, is_full, remote_volume_id)| {
                Ok(Fileset {
                    id,
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map_err(|e| anyhow::anyhow!(e))?
                        .with_timezone(&Utc),
                    is_full_backup: is_full != 0,
                    remote_volume_id,
                })
            })
            .transpose()
    }

    pub fn fileset_entries(&self, fileset_id: i64) -> Result<Vec<(FileRecord, FilesetEntry)>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.id, f.path, f.content_blockset_id, f.metadata_blockset_id, f.kind,
                    fe.fileset_id, fe.file_id, fe.modified, fe.lastmodified
             FROM fileset_entry fe JOIN file f ON f.id = fe.file_id
             WHERE fe.fileset_id = ?1",
        )?;
        let rows = stmt.query_map(params![fileset_id], |r| {
            let kind_str: String = r.get(4)?;
            let kind = match kind_str.as_str() {
                "folder" => FileKind::Folder,
                "symlink" => FileKind::Symlink,
                _ => FileKind::File,
            };
            let modified: String = r.get(7)?;
            Ok((
                FileRecord {
                    id: r.get(0)?,
                    path: r.get(1)?,
                    content_blockset_id: r.get(2)?,
                    metadata_blockset_id: r.get(3)?,
                    kind,
                },
                FilesetEntry {
                    fileset_id: r.get(5)?,
                    file_id: r.get(6)?,
                    modified: DateTime::parse_from_rfc3339(&modified)
                        .unwrap()
                        .with_timezone(&Utc),
                    lastmodified: r.get::<_, i64>(8)? != 0,
                },
            ))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    /// Files referenced by no fileset at all — a precondition violation for
    /// purge/compact if nonzero (spec.md §4.5 precondition).
    pub fn count_orphan_files(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM file f
                 WHERE NOT EXISTS (SELECT 1 FROM fileset_entry fe WHERE fe.file_id = f.id)",
                [],
                |r| r.get(0),
            )
            .map_err(CoreError::from)
    }

    /// Deletes the given filesets and their membership rows, leaving
    /// referenced files/blocksets/blocks in place for later orphan collection.
    pub fn drop_filesets_from_table(&mut self, ids: &[i64]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM fileset_entry WHERE fileset_id = ?1", params![id])?;
            tx.execute("DELETE FROM fileset WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes file/blockset/block rows that became unreachable after a
    /// `drop_filesets_from_table` call. Returns the ids of blocks whose data
    /// is now safe to physically remove from a rewritten dblock volume.
    pub fn sweep_orphans(&mut self) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "DELETE FROM file WHERE NOT EXISTS (SELECT 1 FROM fileset_entry fe WHERE fe.file_id = file.id)",
            [],
        )?;
        tx.execute(
            "DELETE FROM blockset WHERE id NOT IN (
                 SELECT content_blockset_id FROM file WHERE content_blockset_id IS NOT NULL
                 UNION
                 SELECT metadata_blockset_id FROM file WHERE metadata_blockset_id IS NOT NULL
             )",
            [],
        )?;

        let orphan_block_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT b.id FROM block b
                 WHERE NOT EXISTS (SELECT 1 FROM blockset_entry be WHERE be.block_id = b.id)",
            )?;
            stmt.query_map([], |r| r.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        tx.execute(
            "DELETE FROM block WHERE NOT EXISTS (SELECT 1 FROM blockset_entry be WHERE be.block_id = block.id)",
            [],
        )?;

        tx.commit()?;
        Ok(orphan_block_ids)
    }

    // ─── Remote volumes ─────────────────────────────────────────────────────

    pub fn create_remote_volume(&self, name: &str, kind: VolumeKind, size: u64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO remote_volume (name, kind, size, hash, state, delete_grace_time)
             VALUES (?1, ?2, ?3, NULL, ?4, NULL)",
            params![name, kind.to_string(), size as i64, VolumeState::Temporary.to_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_remote_volume(&self, id: i64) -> Result<Option<RemoteVolume>> {
        self.conn
            .query_row(
                "SELECT id, name, kind, size, hash, state, delete_grace_time FROM remote_volume WHERE id = ?1",
                params![id],
                row_to_remote_volume,
            )
            .optional()
            .map_err(CoreError::from)
    }

    /// Advances a remote volume's lifecycle state, enforcing P6.
    pub fn update_remote_volume(&self, id: i64, next: VolumeState, hash: Option<&str>) -> Result<()> {
        let current = self
            .get_remote_volume(id)?
            .ok_or_else(|| anyhow::anyhow!("remote volume {id} not found"))?;

        if !current.state.can_transition_to(next) {
            return Err(InvariantError::IllegalStateTransition {
                id,
                from: current.state,
                to: next,
            }
            .into());
        }

        let grace = if next == VolumeState::Deleting {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };

        self.conn.execute(
            "UPDATE remote_volume SET state = ?1, hash = COALESCE(?2, hash), delete_grace_time = COALESCE(?3, delete_grace_time) WHERE id = ?4",
            params![next.to_string(), hash, grace, id],
        )?;
        Ok(())
    }

    /// Evaluates a caller-supplied boolean SQL fragment against a single
    /// synthetic `(path, kind)` row — backs `PurgeFilter::CatalogSelector`.
    /// `selector` may reference the bound columns `path` and `kind`.
    pub fn eval_selector(&self, selector: &str, path: &str, kind: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM (SELECT ?1 AS path, ?2 AS kind) WHERE {selector}");
        let matched = self
            .conn
            .query_row(&sql, params![path, kind], |r| r.get::<_, i64>(0))
            .optional()?;
        Ok(matched.is_some())
    }

    pub fn find_remote_volume_by_name(&self, name: &str) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT id FROM remote_volume WHERE name = ?1", params![name], |r| r.get(0))
            .optional()
            .map_err(CoreError::from)
    }

    pub fn list_remote_volumes(&self, state_filter: Option<VolumeState>) -> Result<Vec<RemoteVolume>> {
        let mut stmt = match state_filter {
            Some(_) => self.conn.prepare(
                "SELECT id, name, kind, size, hash, state, delete_grace_time FROM remote_volume WHERE state = ?1",
            )?,
            None => self
                .conn
                .prepare("SELECT id, name, kind, size, hash, state, delete_grace_time FROM remote_volume")?,
        };

        let rows = match state_filter {
            Some(s) => stmt.query_map(params![s.to_string()], row_to_remote_volume)?.collect(),
            None => stmt.query_map([], row_to_remote_volume)?.collect(),
        };
        rows.map_err(CoreError::from)
    }

    /// Generates a filename not already present in `remote_volume`, retrying
    /// with a fresh random suffix on collision (practically never hit, but
    /// the design calls for probing rather than assuming uniqueness).
    pub fn probe_unused_filename<F>(&self, mut make_name: F) -> Result<String>
    where
        F: FnMut() -> String,
    {
        for _ in 0..32 {
            let candidate = make_name();
            let exists: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM remote_volume WHERE name = ?1",
                params![candidate],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Ok(candidate);
            }
        }
        Err(anyhow::anyhow!("could not find an unused volume filename after 32 attempts").into())
    }

    /// Every block physically stored in `volume_id` that is still referenced
    /// by at least one blockset — the working set compact needs to carry
    /// forward into a rewritten volume.
    pub fn blocks_referenced_in_volume(&self, volume_id: i64) -> Result<Vec<Block>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, hash, size FROM block b
             WHERE b.volume_id = ?1
               AND EXISTS (SELECT 1 FROM blockset_entry be WHERE be.block_id = b.id)",
        )?;
        let blocks = stmt
            .query_map(params![volume_id], |r| {
                Ok(Block {
                    id: r.get(0)?,
                    hash: r.get(1)?,
                    size: r.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(blocks)
    }

    /// `(total_bytes, referenced_bytes)` for every block physically stored
    /// in `volume_id` — the basis of compact's referenced-fraction test.
    pub fn volume_reference_stats(&self, volume_id: i64) -> Result<(u64, u64)> {
        let total: i64 = self
            .conn
            .query_row("SELECT COALESCE(SUM(size), 0) FROM block WHERE volume_id = ?1", params![volume_id], |r| r.get(0))?;
        let referenced: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(b.size), 0) FROM block b
             WHERE b.volume_id = ?1
               AND EXISTS (SELECT 1 FROM blockset_entry be WHERE be.block_id = b.id)",
            params![volume_id],
            |r| r.get(0),
        )?;
        Ok((total as u64, referenced as u64))
    }

    // ─── Repair / operation state ───────────────────────────────────────────

    /// Whether the most recent operation was interrupted while volumes were
    /// still mid-upload (spec.md §4.4 precondition for purge/compact).
    pub fn terminated_with_active_uploads(&self) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT terminated_with_active_uploads FROM operation ORDER BY id DESC LIMIT 1",
                [],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.unwrap_or(0) != 0)
            .map_err(CoreError::from)
    }

    pub fn begin_operation(&self, kind: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO operation (kind, started_at, terminated_with_active_uploads) VALUES (?1, ?2, 1)",
            params![kind, Utc::now().to_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_terminated_with_active_uploads(&self, operation_id: i64, value: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE operation SET terminated_with_active_uploads = ?1 WHERE id = ?2",
            params![value as i64, operation_id],
        )?;
        Ok(())
    }

    /// True if any remote volume is stuck mid-upload (`uploading`) or
    /// mid-delete (`deleting`) with no operation actively tending it —
    /// the catalog's signal that a `repair` pass is needed before
    /// purge/compact may run.
    pub fn is_partially_recreated(&self) -> Result<bool> {
        let stuck: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM remote_volume WHERE state IN ('uploading', 'deleting')",
            [],
            |r| r.get(0),
        )?;
        Ok(stuck > 0 && self.terminated_with_active_uploads()?)
    }

    /// Checks referential integrity across the whole catalog (P3): every
    /// blockset_entry points at a real block, every fileset_entry at a real
    /// file, every file's blocksets exist.
    pub fn verify_consistency(&self) -> Result<()> {
        let dangling_blockset_entries: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM blockset_entry be WHERE NOT EXISTS (SELECT 1 FROM block b WHERE b.id = be.block_id)",
            [],
            |r| r.get(0),
        )?;
        if dangling_blockset_entries > 0 {
            return Err(InvariantError::Referential(format!(
                "{dangling_blockset_entries} blockset_entry row(s) reference a missing block"
            ))
            .into());
        }

        let dangling_fileset_entries: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM fileset_entry fe WHERE NOT EXISTS (SELECT 1 FROM file f WHERE f.id = fe.file_id)",
            [],
            |r| r.get(0),
        )?;
        if dangling_fileset_entries > 0 {
            return Err(InvariantError::Referential(format!(
                "{dangling_fileset_entries} fileset_entry row(s) reference a missing file"
            ))
            .into());
        }

        let dangling_file_blocksets: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM file f
             WHERE (f.content_blockset_id IS NOT NULL AND NOT EXISTS (SELECT 1 FROM blockset bs WHERE bs.id = f.content_blockset_id))
                OR (f.metadata_blockset_id IS NOT NULL AND NOT EXISTS (SELECT 1 FROM blockset bs WHERE bs.id = f.metadata_blockset_id))",
            [],
            |r| r.get(0),
        )?;
        if dangling_file_blocksets > 0 {
            return Err(InvariantError::Referential(format!(
                "{dangling_file_blocksets} file row(s) reference a missing blockset"
            ))
            .into());
        }

        Ok(())
    }
}

fn row_to_remote_volume(r: &rusqlite::Row) -> rusqlite::Result<RemoteVolume> {
    let kind_str: String = r.get(2)?;
    let kind = match kind_str.as_str() {
        "dindex" => VolumeKind::DIndex,
        "dfileset" => VolumeKind::DFileset,
        _ => VolumeKind::DBlock,
    };
    let state_str: String = r.get(5)?;
    let state = match state_str.as_str() {
        "uploading" => VolumeState::Uploading,
        "uploaded" => VolumeState::Uploaded,
        "verified" => VolumeState::Verified,
        "deleting" => VolumeState::Deleting,
        "deleted" => VolumeState::Deleted,
        _ => VolumeState::Temporary,
    };
    let grace: Option<String> = r.get(6)?;
    Ok(RemoteVolume {
        id: r.get(0)?,
        name: r.get(1)?,
        kind,
        size: r.get::<_, i64>(3)? as u64,
        hash: r.get(4)?,
        state,
        delete_grace_time: grace
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VolumeState;

    #[test]
    fn intern_block_dedupes_by_hash() {
        let cat = Catalog::open_in_memory().unwrap();
        let a = cat.intern_block("h1", 100).unwrap();
        let b = cat.intern_block("h1", 100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn intern_block_rejects_size_collision() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.intern_block("h1", 100).unwrap();
        let err = cat.intern_block("h1", 200).unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantError::BlockHashSizeCollision { .. })));
    }

    #[test]
    fn write_fileset_roundtrip() {
        let mut cat = Catalog::open_in_memory().unwrap();
        let block_id = cat.intern_block("h1", 10).unwrap();
        let blockset_id = cat
            .intern_blockset("bs1", 10, &[(block_id, "h1".into(), 10)])
            .unwrap();

        let mut temp = cat.create_temporary_fileset(Utc::now(), true).unwrap();
        temp.push(TempFilesetEntry {
            path: "a.txt".into(),
            kind: FileKind::File,
            content_blockset_id: Some(blockset_id),
            metadata_blockset_id: None,
            modified: Utc::now(),
            lastmodified: false,
        });
        let fileset_id = cat.write_fileset(temp).unwrap();

        let entries = cat.fileset_entries(fileset_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.path, "a.txt");
        assert_eq!(cat.count_orphan_files().unwrap(), 0);
    }

    #[test]
    fn non_monotonic_fileset_rejected() {
        let cat = Catalog::open_in_memory().unwrap();
        let t1 = Utc::now();
        let _ = cat.create_temporary_fileset(t1, true).unwrap();

        // second call with a timestamp claiming to be in the past, after
        // one fileset already exists at t1, must be rejected once committed.
        let mut cat2 = cat;
        let mut temp = cat2.create_temporary_fileset(t1, true).unwrap();
        temp.is_full_backup = true;
        cat2.write_fileset(temp).unwrap();

        let earlier = t1 - chrono::Duration::seconds(5);
        let err = cat2.create_temporary_fileset(earlier, true).unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantError::NonMonotonicFileset(_, _))));
    }

    #[test]
    fn remote_volume_state_machine_enforced() {
        let cat = Catalog::open_in_memory().unwrap();
        let id = cat.create_remote_volume("v1.zip.aes", VolumeKind::DBlock, 1024).unwrap();
        cat.update_remote_volume(id, VolumeState::Uploading, None).unwrap();
        cat.update_remote_volume(id, VolumeState::Uploaded, Some("h")).unwrap();

        let err = cat.update_remote_volume(id, VolumeState::Temporary, None).unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantError::IllegalStateTransition { .. })));
    }

    #[test]
    fn drop_filesets_then_sweep_orphans() {
        let mut cat = Catalog::open_in_memory().unwrap();
        let block_id = cat.intern_block("h1", 10).unwrap();
        let blockset_id = cat.intern_blockset("bs1", 10, &[(block_id, "h1".into(), 10)]).unwrap();

        let mut temp = cat.create_temporary_fileset(Utc::now(), true).unwrap();
        temp.push(TempFilesetEntry {
            path: "a.txt".into(),
            kind: FileKind::File,
            content_blockset_id: Some(blockset_id),
            metadata_blockset_id: None,
            modified: Utc::now(),
            lastmodified: false,
        });
        let fileset_id = cat.write_fileset(temp).unwrap();

        cat.drop_filesets_from_table(&[fileset_id]).unwrap();
        assert_eq!(cat.count_orphan_files().unwrap(), 1);

        let freed_blocks = cat.sweep_orphans().unwrap();
        assert_eq!(freed_blocks, vec![block_id]);
        assert_eq!(cat.count_orphan_files().unwrap(), 0);
    }

    #[test]
    fn consistency_check_passes_on_clean_catalog() {
        let mut cat = Catalog::open_in_memory().unwrap();
        let block_id = cat.intern_block("h1", 10).unwrap();
        let blockset_id = cat.intern_blockset("bs1", 10, &[(block_id, "h1".into(), 10)]).unwrap();
        let mut temp = cat.create_temporary_fileset(Utc::now(), true).unwrap();
        temp.push(TempFilesetEntry {
            path: "a.txt".into(),
            kind: FileKind::File,
            content_blockset_id: Some(blockset_id),
            metadata_blockset_id: None,
            modified: Utc::now(),
            lastmodified: false,
        });
        cat.write_fileset(temp).unwrap();
        cat.verify_consistency().unwrap();
    }
}
