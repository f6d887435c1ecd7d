//! SQL schema for the local catalog, grounded in the same
//! `CREATE TABLE IF NOT EXISTS` + `PRAGMA user_version` migration pattern
//! used by `b2_backup`'s manifest store.

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS block (
    id      INTEGER PRIMARY KEY,
    hash    TEXT NOT NULL,
    size    INTEGER NOT NULL,
    volume_id INTEGER REFERENCES remote_volume(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_block_hash ON block(hash);

CREATE TABLE IF NOT EXISTS blockset (
    id         INTEGER PRIMARY KEY,
    length     INTEGER NOT NULL,
    full_hash  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blockset_hash ON blockset(full_hash);

CREATE TABLE IF NOT EXISTS blockset_entry (
    blockset_id INTEGER NOT NULL REFERENCES blockset(id),
    ordinal     INTEGER NOT NULL,
    block_id    INTEGER NOT NULL REFERENCES block(id),
    PRIMARY KEY (blockset_id, ordinal)
);

CREATE TABLE IF NOT EXISTS file (
    id                    INTEGER PRIMARY KEY,
    path                  TEXT NOT NULL,
    kind                  TEXT NOT NULL,
    content_blockset_id   INTEGER REFERENCES blockset(id),
    metadata_blockset_id  INTEGER REFERENCES blockset(id)
);
-- A (path, content, metadata) tuple is interned once and reused by every
-- fileset that happens to see the file unchanged; distinct content/metadata
-- at the same path gets its own row.
CREATE UNIQUE INDEX IF NOT EXISTS idx_file_identity ON file(
    path,
    COALESCE(content_blockset_id, -1),
    COALESCE(metadata_blockset_id, -1)
);
CREATE INDEX IF NOT EXISTS idx_file_path ON file(path);

CREATE TABLE IF NOT EXISTS fileset (
    id               INTEGER PRIMARY KEY,
    timestamp        TEXT NOT NULL,
    is_full_backup   INTEGER NOT NULL,
    remote_volume_id INTEGER REFERENCES remote_volume(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_fileset_timestamp ON fileset(timestamp);

CREATE TABLE IF NOT EXISTS fileset_entry (
    fileset_id   INTEGER NOT NULL REFERENCES fileset(id),
    file_id      INTEGER NOT NULL REFERENCES file(id),
    modified     TEXT NOT NULL,
    lastmodified INTEGER NOT NULL,
    PRIMARY KEY (fileset_id, file_id)
);

CREATE TABLE IF NOT EXISTS remote_volume (
    id                INTEGER PRIMARY KEY,
    name              TEXT NOT NULL,
    kind              TEXT NOT NULL,
    size              INTEGER NOT NULL,
    hash              TEXT,
    state             TEXT NOT NULL,
    delete_grace_time TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_remote_volume_name ON remote_volume(name);

CREATE TABLE IF NOT EXISTS operation (
    id          INTEGER PRIMARY KEY,
    kind        TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    terminated_with_active_uploads INTEGER NOT NULL DEFAULT 0
);
"#;
