//! # Purge Engine
//!
//! Rewrites filesets under a filter, dropping or updating the entries it
//! matches, while preserving every other version untouched (spec.md §4.5).
//! Filesets are processed oldest-first so each rewrite's new timestamp can
//! be probed strictly between its own original slot and the next-newer
//! fileset, preserving monotonicity (P4) throughout.

use crate::catalog::{Catalog, TempFileset, TempFilesetEntry};
use crate::compact::{self, CompactOptions, CompactReport};
use crate::config::CompressionKind;
use crate::error::{CatalogStateError, CoreError, Result, UserInputError};
use crate::model::{FileKind, VolumeKind, VolumeState};
use crate::object_store::VolumeQueue;
use crate::progress::{self, Phase, ProgressSink};
use crate::volume::{self, FilesetFileEntry, VolumeManifest, VolumeName};
use chrono::Utc;
use std::path::PathBuf;
use tracing::info;

/// How a purge decides which entries of a fileset to drop.
pub enum PurgeFilter {
    /// Glob matched against each entry's catalog path.
    PathGlob(glob::Pattern),
    /// An opaque catalog-level predicate — a boolean SQL expression
    /// evaluated over `file` columns (`path`, `kind`), e.g.
    /// `"kind = 'file' AND path LIKE '%.tmp'"`. Kept as a raw fragment
    /// rather than a typed AST per spec.md §9's open question, since the
    /// CLI is the only caller and already trusts its own arguments.
    CatalogSelector(CompiledSelector),
    /// Several filters given on one CLI invocation (`purge <destination> <filter...>`),
    /// matching an entry if any of them do.
    AnyOf(Vec<PurgeFilter>),
}

pub struct CompiledSelector(pub String);

impl PurgeFilter {
    fn matches(&self, catalog: &Catalog, path: &str, kind: FileKind) -> Result<bool> {
        match self {
            PurgeFilter::PathGlob(pattern) => Ok(pattern.matches(path)),
            PurgeFilter::CatalogSelector(selector) => catalog.eval_selector(&selector.0, path, &kind.to_string()),
            PurgeFilter::AnyOf(filters) => {
                for f in filters {
                    if f.matches(catalog, path, kind)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PurgeFilter::PathGlob(p) => p.as_str().is_empty(),
            PurgeFilter::CatalogSelector(_) => false,
            PurgeFilter::AnyOf(filters) => filters.is_empty() || filters.iter().all(PurgeFilter::is_empty),
        }
    }
}

/// Which filesets a purge touches.
pub enum VersionSelection {
    All,
    /// 0 = newest, 1 = second-newest, and so on.
    Versions(Vec<usize>),
    Times(Vec<chrono::DateTime<Utc>>),
}

impl VersionSelection {
    fn resolve(&self, catalog: &Catalog) -> Result<Vec<i64>> {
        let ids = catalog.get_fileset_ids()?; // oldest first
        let selected: Vec<i64> = match self {
            VersionSelection::All => ids,
            VersionSelection::Versions(versions) => {
                let newest_first: Vec<i64> = ids.into_iter().rev().collect();
                versions
                    .iter()
                    .filter_map(|&v| newest_first.get(v).copied())
                    .collect()
            }
            VersionSelection::Times(times) => {
                let mut selected = Vec::new();
                for id in ids {
                    if let Some(fs) = catalog.get_fileset(id)? {
                        if times.contains(&fs.timestamp) {
                            selected.push(id);
                        }
                    }
                }
                selected
            }
        };
        if selected.is_empty() {
            return Err(UserInputError::NoMatchingVersions.into());
        }
        // oldest first
        let mut sortable: Vec<(chrono::DateTime<Utc>, i64)> = Vec::new();
        for id in selected {
            if let Some(fs) = catalog.get_fileset(id)? {
                sortable.push((fs.timestamp, id));
            }
        }
        sortable.sort_by_key(|(ts, _)| *ts);
        Ok(sortable.into_iter().map(|(_, id)| id).collect())
    }
}

pub struct PurgeOptions {
    pub dry_run: bool,
    pub no_auto_compact: bool,
    pub no_backend_verification: bool,
    pub full_result: bool,
    pub prefix: String,
    pub compression: CompressionKind,
    pub compression_level: i32,
    pub password: Option<String>,
}

#[derive(Debug, Default)]
pub struct PurgeReport {
    pub filesets_rewritten: usize,
    pub filesets_unchanged: usize,
    pub entries_removed: usize,
    pub entries_updated: usize,
    pub compact: Option<CompactReport>,
}

/// Runs the full algorithm of spec.md §4.5, steps 1–9.
pub async fn run_purge(
    catalog: &mut Catalog,
    queue: Option<&VolumeQueue>,
    filter: &PurgeFilter,
    selection: &VersionSelection,
    options: &PurgeOptions,
    progress: &ProgressSink,
) -> Result<PurgeReport> {
    // Precondition 1: an empty filter would purge every file in the fileset.
    if filter.is_empty() {
        return Err(UserInputError::EmptyFilterPurgeNotAllowed.into());
    }
    // Precondition 2.
    if catalog.is_partially_recreated()? {
        return Err(CatalogStateError::PartiallyRecreated(PathBuf::new()).into());
    }
    // Precondition 3.
    let orphans = catalog.count_orphan_files()?;
    if orphans != 0 {
        return Err(CatalogStateError::OrphanFilesPresent { count: orphans }.into());
    }
    // Precondition 4 happens inside `resolve` (errors on zero matches).
    let fileset_ids = selection.resolve(catalog)?;
    // Precondition 5: the backend matches what the catalog believes exists,
    // unless the caller explicitly opted out of strict verification.
    if !options.no_backend_verification {
        if let Some(queue) = queue {
            crate::verify::verify_remote(catalog, queue.store().as_ref()).await?;
        }
    }

    let mut report = PurgeReport::default();
    let total = fileset_ids.len();

    for (index, fileset_id) in fileset_ids.iter().enumerate() {
        let (offset, span) = progress::sub_span(0.0, 1.0 - progress::COMPACT_TRAILING_SPAN, index, total);
        progress.emit(Phase::Purge, offset);

        let original = catalog
            .get_fileset(*fileset_id)?
            .ok_or_else(|| anyhow::anyhow!("fileset {fileset_id} vanished mid-purge"))?;
        let entries = catalog.fileset_entries(*fileset_id)?;

        let mut kept = Vec::new();
        let mut removed_count = 0usize;
        let mut updated_count = 0usize;
        for (file, membership) in entries {
            if filter.matches(catalog, &file.path, file.kind)? {
                removed_count += 1;
                continue;
            }
            updated_count += membership.lastmodified as usize;
            kept.push((file, membership));
        }

        if removed_count == 0 {
            report.filesets_unchanged += 1;
            progress.emit(Phase::Purge, offset + span);
            continue;
        }

        report.entries_removed += removed_count;
        report.entries_updated += updated_count;
        report.filesets_rewritten += 1;

        if options.dry_run {
            progress.emit(Phase::Purge, offset + span);
            continue;
        }

        let next_newer = fileset_ids
            .get(index + 1)
            .map(|id| catalog.get_fileset(*id))
            .transpose()?
            .flatten()
            .map(|fs| fs.timestamp);
        let t_new = catalog.probe_new_fileset_timestamp(original.timestamp, next_newer)?;

        let mut file_entries: Vec<FilesetFileEntry> = Vec::with_capacity(kept.len());
        for (file, membership) in &kept {
            let content_blockset_hash = file
                .content_blockset_id
                .map(|id| catalog.get_blockset(id))
                .transpose()?
                .flatten()
                .map(|bs| bs.full_hash);
            let metadata_blockset_hash = file
                .metadata_blockset_id
                .map(|id| catalog.get_blockset(id))
                .transpose()?
                .flatten()
                .map(|bs| bs.full_hash);
            file_entries.push(FilesetFileEntry {
                path: file.path.clone(),
                kind: file.kind,
                content_blockset_hash,
                metadata_blockset_hash,
                modified: membership.modified,
                lastmodified: membership.lastmodified,
            });
        }

        let manifest = VolumeManifest {
            version: 1,
            created: t_new,
            encoding: "utf8".into(),
            blocksize: 0,
            block_hash: "blake3".into(),
            file_hash: "blake3".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
        };
        let container = volume::encode_dfileset(&manifest, &file_entries)?;
        let packed = volume::pack(container, options.compression, options.compression_level, options.password.as_deref())?;

        let name = catalog.probe_unused_filename(|| {
            VolumeName::new(&options.prefix, VolumeKind::DFileset, t_new, options.compression, options.password.is_some())
                .to_file_name()
        })?;

        let new_volume_id = catalog.create_remote_volume(&name, VolumeKind::DFileset, packed.len() as u64)?;
        catalog.update_remote_volume(new_volume_id, VolumeState::Uploading, None)?;

        let temp = TempFileset {
            timestamp: t_new,
            is_full_backup: original.is_full_backup,
            entries: kept
                .into_iter()
                .map(|(file, membership)| TempFilesetEntry {
                    path: file.path,
                    kind: file.kind,
                    content_blockset_id: file.content_blockset_id,
                    metadata_blockset_id: file.metadata_blockset_id,
                    modified: membership.modified,
                    lastmodified: membership.lastmodified,
                })
                .collect(),
        };
        let new_fileset_id = catalog.write_fileset(temp)?;
        catalog.attach_fileset_volume(new_fileset_id, new_volume_id)?;

        let old_volume_name = if let Some(old_volume_id) = original.remote_volume_id {
            catalog.update_remote_volume(old_volume_id, VolumeState::Deleting, None)?;
            catalog.get_remote_volume(old_volume_id)?.map(|v| v.name)
        } else {
            None
        };
        catalog.drop_filesets_from_table(&[*fileset_id])?;

        info!(fileset_id = new_fileset_id, %name, "purge rewrote fileset");

        // Step 7 is the catalog commit above; step 8 is the upload/delete pair.
        if let Some(queue) = queue {
            queue.upload(name, packed).await?;
            catalog.update_remote_volume(new_volume_id, VolumeState::Uploaded, None)?;
            if let Some(old_name) = old_volume_name {
                queue.delete(old_name).await?;
            }
            queue.wait_for_empty().await?;
        }

        progress.emit(Phase::Purge, offset + span);
    }

    if report.filesets_rewritten > 0 && !options.no_auto_compact {
        let compact_options = CompactOptions {
            prefix: options.prefix.clone(),
            compression: options.compression,
            compression_level: options.compression_level,
            password: options.password.clone(),
            no_backend_verification: options.no_backend_verification,
            ..CompactOptions::default()
        };
        let compact_offset = 1.0 - progress::COMPACT_TRAILING_SPAN;
        progress.emit(Phase::Compact, compact_offset);
        let compact_report = compact::run_compact(catalog, queue, &compact_options, progress).await?;
        report.compact = Some(compact_report);
    }

    progress.emit(Phase::Purge, 1.0);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TempFilesetEntry as TFE;

    fn sample_catalog() -> Catalog {
        let mut cat = Catalog::open_in_memory().unwrap();
        let block_id = cat.intern_block("h1", 10).unwrap();
        let blockset_id = cat.intern_blockset("bs1", 10, &[(block_id, "h1".into(), 10)]).unwrap();

        let mut temp = cat.create_temporary_fileset(Utc::now(), true).unwrap();
        temp.push(TFE {
            path: "keep.txt".into(),
            kind: FileKind::File,
            content_blockset_id: Some(blockset_id),
            metadata_blockset_id: None,
            modified: Utc::now(),
            lastmodified: false,
        });
        temp.push(TFE {
            path: "secret.key".into(),
            kind: FileKind::File,
            content_blockset_id: Some(blockset_id),
            metadata_blockset_id: None,
            modified: Utc::now(),
            lastmodified: false,
        });
        cat.write_fileset(temp).unwrap();
        cat
    }

    #[tokio::test]
    async fn empty_filter_is_rejected() {
        let mut cat = sample_catalog();
        let filter = PurgeFilter::PathGlob(glob::Pattern::new("").unwrap());
        let options = PurgeOptions {
            dry_run: true,
            no_auto_compact: true,
            no_backend_verification: true,
            full_result: false,
            prefix: "repocore".into(),
            compression: CompressionKind::Zstd,
            compression_level: 3,
            password: None,
        };
        let (sink, _rx) = progress::channel();
        let err = run_purge(&mut cat, None, &filter, &VersionSelection::All, &options, &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UserInput(UserInputError::EmptyFilterPurgeNotAllowed)));
    }

    #[tokio::test]
    async fn dry_run_does_not_mutate_catalog() {
        let mut cat = sample_catalog();
        let before = cat.get_fileset_ids().unwrap();

        let filter = PurgeFilter::PathGlob(glob::Pattern::new("*.key").unwrap());
        let options = PurgeOptions {
            dry_run: true,
            no_auto_compact: true,
            no_backend_verification: true,
            full_result: false,
            prefix: "repocore".into(),
            compression: CompressionKind::Zstd,
            compression_level: 3,
            password: None,
        };
        let (sink, _rx) = progress::channel();
        let report = run_purge(&mut cat, None, &filter, &VersionSelection::All, &options, &sink)
            .await
            .unwrap();
        assert_eq!(report.filesets_rewritten, 1);
        assert_eq!(report.entries_removed, 1);

        let after = cat.get_fileset_ids().unwrap();
        assert_eq!(before, after, "dry-run must not change catalog state");
    }

    #[tokio::test]
    async fn wet_run_rewrites_fileset_and_drops_matched_entry() {
        let mut cat = sample_catalog();
        let filter = PurgeFilter::PathGlob(glob::Pattern::new("*.key").unwrap());
        let options = PurgeOptions {
            dry_run: false,
            no_auto_compact: true,
            no_backend_verification: true,
            full_result: false,
            prefix: "repocore".into(),
            compression: CompressionKind::Zstd,
            compression_level: 3,
            password: None,
        };
        let (sink, _rx) = progress::channel();
        let report = run_purge(&mut cat, None, &filter, &VersionSelection::All, &options, &sink)
            .await
            .unwrap();
        assert_eq!(report.filesets_rewritten, 1);

        let ids = cat.get_fileset_ids().unwrap();
        assert_eq!(ids.len(), 1);
        let entries = cat.fileset_entries(ids[0]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.path, "keep.txt");
    }
}
