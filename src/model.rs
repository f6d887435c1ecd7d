//! # Data Model
//!
//! Plain domain types for blocks, blocksets, files, filesets, and remote
//! volumes. These mirror the catalog schema row-for-row but stay free of
//! any `rusqlite` dependency so they can be constructed and asserted on in
//! tests without a database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-size content chunk identified by `(hash, size)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: i64,
    pub hash: String,
    pub size: u64,
}

/// One block's position within a blockset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    pub ordinal: i64,
    pub block_id: i64,
    pub hash: String,
    pub size: u64,
}

/// An ordered sequence of blocks representing a file's content or metadata stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blockset {
    pub id: i64,
    pub length: u64,
    pub full_hash: String,
    pub blocks: Vec<BlockRef>,
}

impl Blockset {
    /// Checks P2: concatenated block lengths equal the declared length, and
    /// every non-terminal block is exactly `blocksize`.
    pub fn verify_lengths(&self, blocksize: u64) -> bool {
        let sum: u64 = self.blocks.iter().map(|b| b.size).sum();
        if sum != self.length {
            return false;
        }
        let last = self.blocks.len().saturating_sub(1);
        self.blocks
            .iter()
            .enumerate()
            .all(|(i, b)| i == last || b.size == blocksize)
    }
}

/// The kind of filesystem entry a `FileRecord` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
    Symlink,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::File => write!(f, "file"),
            FileKind::Folder => write!(f, "folder"),
            FileKind::Symlink => write!(f, "symlink"),
        }
    }
}

/// A path/content/metadata tuple, interned once and referenced by filesets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub content_blockset_id: Option<i64>,
    pub metadata_blockset_id: Option<i64>,
    pub kind: FileKind,
}

impl FileRecord {
    /// The catalog treats `/`-terminated paths as folders.
    pub fn is_folder_path(path: &str) -> bool {
        path.ends_with('/')
    }
}

/// A versioned snapshot of the source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fileset {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub is_full_backup: bool,
    pub remote_volume_id: Option<i64>,
}

/// A single file's membership in a fileset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesetEntry {
    pub fileset_id: i64,
    pub file_id: i64,
    pub modified: DateTime<Utc>,
    pub lastmodified: bool,
}

/// The three kinds of remote volume blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    DBlock,
    DIndex,
    DFileset,
}

impl VolumeKind {
    /// The single-letter code used in the on-disk filename (spec.md §6).
    pub fn letter(&self) -> char {
        match self {
            VolumeKind::DBlock => 'b',
            VolumeKind::DIndex => 'i',
            VolumeKind::DFileset => 'f',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            'b' => Some(VolumeKind::DBlock),
            'i' => Some(VolumeKind::DIndex),
            'f' => Some(VolumeKind::DFileset),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeKind::DBlock => write!(f, "dblock"),
            VolumeKind::DIndex => write!(f, "dindex"),
            VolumeKind::DFileset => write!(f, "dfileset"),
        }
    }
}

/// The remote-volume lifecycle state machine (spec.md §4.3).
///
/// ```text
/// temporary ── promote ──▶ uploading ── ack ──▶ uploaded ── verify ──▶ verified
///      │                                             │                     │
///      └──────────── abort ─────────────▶ deleting ◀─┴─── retire ──────────┘
///                                               │
///                                           deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Temporary,
    Uploading,
    Uploaded,
    Verified,
    Deleting,
    Deleted,
}

impl VolumeState {
    /// P6: only the documented forward transitions and the three back-edges
    /// (`temporary -> deleting` on abort, `{uploaded,verified} -> deleting`
    /// on retire, `uploading -> deleting` when repair gives up on a stalled
    /// upload left by a crashed session) are legal.
    pub fn can_transition_to(self, next: VolumeState) -> bool {
        use VolumeState::*;
        matches!(
            (self, next),
            (Temporary, Uploading)
                | (Uploading, Uploaded)
                | (Uploaded, Verified)
                | (Temporary, Deleting)
                | (Uploaded, Deleting)
                | (Verified, Deleting)
                | (Uploading, Deleting)
                | (Deleting, Deleted)
        )
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeState::Temporary => "temporary",
            VolumeState::Uploading => "uploading",
            VolumeState::Uploaded => "uploaded",
            VolumeState::Verified => "verified",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// A single remote blob and its catalog-tracked lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVolume {
    pub id: i64,
    pub name: String,
    pub kind: VolumeKind,
    pub size: u64,
    pub hash: Option<String>,
    pub state: VolumeState,
    pub delete_grace_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blockset_length_invariant_holds() {
        let bs = Blockset {
            id: 1,
            length: 150,
            full_hash: "x".into(),
            blocks: vec![
                BlockRef { ordinal: 0, block_id: 1, hash: "a".into(), size: 100 },
                BlockRef { ordinal: 1, block_id: 2, hash: "b".into(), size: 50 },
            ],
        };
        assert!(bs.verify_lengths(100));
    }

    #[test]
    fn blockset_length_invariant_rejects_short_non_terminal() {
        let bs = Blockset {
            id: 1,
            length: 150,
            full_hash: "x".into(),
            blocks: vec![
                BlockRef { ordinal: 0, block_id: 1, hash: "a".into(), size: 50 },
                BlockRef { ordinal: 1, block_id: 2, hash: "b".into(), size: 100 },
            ],
        };
        assert!(!bs.verify_lengths(100));
    }

    #[test]
    fn state_machine_forward_only() {
        use VolumeState::*;
        assert!(Temporary.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Uploaded));
        assert!(Uploaded.can_transition_to(Verified));
        assert!(!Uploading.can_transition_to(Temporary));
        assert!(!Deleted.can_transition_to(Temporary));
    }

    #[test]
    fn state_machine_abort_and_retire_edges() {
        use VolumeState::*;
        assert!(Temporary.can_transition_to(Deleting));
        assert!(Uploaded.can_transition_to(Deleting));
        assert!(Verified.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
        assert!(Uploading.can_transition_to(Deleting));
    }
}
