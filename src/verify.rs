//! # Consistency Verifier
//!
//! Local mode checks the catalog against its own invariants (P1–P4, P6);
//! strict-remote mode additionally lists the backend and reconciles it
//! against what the catalog believes exists (spec.md §4.4).

use crate::catalog::Catalog;
use crate::error::{CatalogStateError, CoreError, IntegrityError, Result};
use crate::model::VolumeState;
use crate::object_store::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// The outcome of a verification pass.
#[derive(Debug, Default, Clone)]
pub struct VerifyReport {
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    pub size_mismatches: Vec<(String, u64, u64)>,
    pub scheduled_for_deletion: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.size_mismatches.is_empty()
    }
}

/// Checks the catalog's own consistency without contacting the backend.
/// Rejects partially-recreated or mid-repair catalogs outright, per
/// spec.md §4.4's precondition for purge/compact.
pub fn verify_local(catalog: &Catalog) -> Result<VerifyReport> {
    if catalog.is_partially_recreated()? {
        return Err(CatalogStateError::PartiallyRecreated(std::path::PathBuf::new()).into());
    }
    catalog.verify_consistency()?;
    Ok(VerifyReport::default())
}

/// Lists the backend and reconciles it against the catalog's remote-volume
/// table. Volumes in `deleting` tolerate absence; `uploaded`/`verified` rows
/// must be present with a matching size. Backend blobs matching a row still
/// in `temporary` state (evidence of a crashed session's partial upload) are
/// scheduled for deletion rather than treated as integrity failures.
pub async fn verify_remote(catalog: &Catalog, store: &dyn ObjectStore) -> Result<VerifyReport> {
    let remote_listing = store.list().await?;
    let remote_sizes: HashMap<String, u64> = remote_listing.into_iter().map(|m| (m.name, m.size)).collect();

    let mut report = VerifyReport::default();
    let rows = catalog.list_remote_volumes(None)?;
    let mut known_names: std::collections::HashSet<&str> = std::collections::HashSet::new();

    for row in &rows {
        known_names.insert(row.name.as_str());
        match remote_sizes.get(&row.name) {
            Some(&actual) => {
                if row.state == VolumeState::Temporary {
                    report.scheduled_for_deletion.push(row.name.clone());
                } else if actual != row.size {
                    warn!(volume = %row.name, expected = row.size, actual, "size mismatch");
                    report.size_mismatches.push((row.name.clone(), row.size, actual));
                }
            }
            None => {
                if matches!(row.state, VolumeState::Uploaded | VolumeState::Verified) {
                    report.missing.push(row.name.clone());
                }
                // `deleting` and `uploading` rows tolerate absence.
            }
        }
    }

    for name in remote_sizes.keys() {
        if !known_names.contains(name.as_str()) {
            report.extra.push(name.clone());
        }
    }

    if !report.missing.is_empty() {
        return Err(IntegrityError::BlobMissing {
            name: report.missing[0].clone(),
        }
        .into());
    }
    if let Some((name, expected, actual)) = report.size_mismatches.first().cloned() {
        return Err(IntegrityError::SizeMismatch { name, expected, actual }.into());
    }
    if let Some(name) = report.extra.first().cloned() {
        return Err(IntegrityError::ExtraBlob { name }.into());
    }

    Ok(report)
}

/// Deletes backend blobs `verify_remote` identified as abandoned partial
/// uploads from a crashed session.
pub async fn reap_scheduled(store: &Arc<dyn ObjectStore>, report: &VerifyReport) -> Result<()> {
    for name in &report.scheduled_for_deletion {
        store.delete(name).await?;
    }
    Ok(())
}

/// Outcome of a [`repair`] pass.
#[derive(Debug, Default)]
pub struct RepairReport {
    pub promoted_to_uploaded: usize,
    pub promoted_to_deleted: usize,
    pub abandoned_uploads: usize,
}

/// Reconciles remote-volume rows left mid-transition by a crashed session
/// (spec.md §8 R3, §9): a row stuck `uploading` is promoted to `uploaded` if
/// the backend already has the bytes, otherwise it has no recoverable
/// content (volume bytes are never retained in the catalog itself) and is
/// moved to `deleting` so the next backup/purge cycle stops waiting on it. A
/// row stuck `deleting` is promoted to `deleted` once the backend confirms
/// the blob is actually gone.
pub async fn repair(catalog: &Catalog, store: &dyn ObjectStore) -> Result<RepairReport> {
    let listing = store.list().await?;
    let present: std::collections::HashSet<String> = listing.into_iter().map(|m| m.name).collect();

    let mut report = RepairReport::default();

    for row in catalog.list_remote_volumes(Some(VolumeState::Uploading))? {
        if present.contains(&row.name) {
            catalog.update_remote_volume(row.id, VolumeState::Uploaded, row.hash.as_deref())?;
            report.promoted_to_uploaded += 1;
        } else {
            catalog.update_remote_volume(row.id, VolumeState::Deleting, None)?;
            report.abandoned_uploads += 1;
        }
    }

    for row in catalog.list_remote_volumes(Some(VolumeState::Deleting))? {
        if !present.contains(&row.name) {
            catalog.update_remote_volume(row.id, VolumeState::Deleted, None)?;
            report.promoted_to_deleted += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VolumeKind;
    use crate::object_store::LocalFsStore;

    #[test]
    fn local_verify_passes_on_empty_catalog() {
        let catalog = Catalog::open_in_memory().unwrap();
        verify_local(&catalog).unwrap();
    }

    #[tokio::test]
    async fn remote_verify_flags_missing_uploaded_volume() {
        let catalog = Catalog::open_in_memory().unwrap();
        let id = catalog.create_remote_volume("v1.zip.aes", VolumeKind::DBlock, 100).unwrap();
        catalog.update_remote_volume(id, VolumeState::Uploading, None).unwrap();
        catalog.update_remote_volume(id, VolumeState::Uploaded, Some("h")).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path()).unwrap();

        let err = verify_remote(&catalog, &store).await.unwrap_err();
        assert!(matches!(err, CoreError::Integrity(IntegrityError::BlobMissing { .. })));
    }

    #[tokio::test]
    async fn remote_verify_tolerates_deleting_absence() {
        let catalog = Catalog::open_in_memory().unwrap();
        let id = catalog.create_remote_volume("v1.zip.aes", VolumeKind::DBlock, 100).unwrap();
        catalog.update_remote_volume(id, VolumeState::Deleting, None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path()).unwrap();

        let report = verify_remote(&catalog, &store).await.unwrap();
        assert!(report.is_clean());
    }
}
