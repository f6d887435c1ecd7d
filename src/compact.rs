//! # Compact Engine
//!
//! Reclaims space in dblock volumes that purge has left mostly empty
//! (spec.md §4.6). Candidate volumes — referenced fraction below a
//! threshold, or absolute wasted bytes above one — are repacked: the blocks
//! still referenced by a surviving blockset are read out, written into a
//! fresh dblock volume with a matching dindex, and the block→volume mapping
//! is repointed inside a transaction before the old volume is retired.
//! Volumes with no surviving references at all are simply deleted.

use crate::catalog::Catalog;
use crate::config::CompressionKind;
use crate::error::Result;
use crate::model::VolumeKind;
use crate::object_store::VolumeQueue;
use crate::progress::{Phase, ProgressSink};
use crate::volume::{self, DindexBlockEntry, VolumeManifest, VolumeName};
use tracing::info;

pub struct CompactOptions {
    pub wasted_threshold: f64,
    pub wasted_bytes_threshold: u64,
    pub prefix: String,
    pub compression: CompressionKind,
    pub compression_level: i32,
    pub password: Option<String>,
    /// Skip the strict remote-list verification pass before rewriting.
    pub no_backend_verification: bool,
}

impl Default for CompactOptions {
    fn default() -> Self {
        CompactOptions {
            wasted_threshold: 0.2,
            wasted_bytes_threshold: 10 * 1024 * 1024,
            prefix: "repocore".into(),
            compression: CompressionKind::Zstd,
            compression_level: 3,
            password: None,
            no_backend_verification: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct CompactReport {
    pub volumes_rewritten: usize,
    pub volumes_deleted_outright: usize,
    pub bytes_reclaimed: u64,
}

struct Candidate {
    volume_id: i64,
    name: String,
    referenced_fraction: f64,
    total_size: u64,
    referenced_size: u64,
}

/// Runs spec.md §4.6.
pub async fn run_compact(
    catalog: &mut Catalog,
    queue: Option<&VolumeQueue>,
    options: &CompactOptions,
    progress: &ProgressSink,
) -> Result<CompactReport> {
    if !options.no_backend_verification {
        if let Some(queue) = queue {
            crate::verify::verify_remote(catalog, queue.store().as_ref()).await?;
        }
    }

    let mut candidates = find_candidates(catalog, options)?;
    candidates.sort_by(|a, b| {
        a.referenced_fraction
            .partial_cmp(&b.referenced_fraction)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.volume_id.cmp(&b.volume_id))
    });

    let mut report = CompactReport::default();
    let total = candidates.len();

    for (index, candidate) in candidates.into_iter().enumerate() {
        progress.emit(Phase::Compact, index as f64 / total.max(1) as f64);

        if candidate.referenced_size == 0 {
            catalog.update_remote_volume(candidate.volume_id, crate::model::VolumeState::Deleting, None)?;
            if let Some(queue) = queue {
                queue.delete(candidate.name.clone()).await?;
            }
            report.volumes_deleted_outright += 1;
            report.bytes_reclaimed += candidate.total_size;
            info!(volume = %candidate.name, "compact deleted fully-unreferenced volume");
            continue;
        }

        let referenced_blocks = catalog.blocks_referenced_in_volume(candidate.volume_id)?;
        if referenced_blocks.is_empty() {
            continue;
        }

        let block_data = if let Some(queue) = queue {
            let packed = queue.store().get(&candidate.name).await?;
            let container = volume::unpack(&packed, options.compression, options.password.as_deref())?;
            let (_, blocks) = volume::decode_dblock(&container)?;
            blocks.into_iter().collect::<std::collections::HashMap<_, _>>()
        } else {
            continue;
        };

        let mut new_blocks = Vec::new();
        let mut index_entries = Vec::new();
        let mut copied_blocks = Vec::new();
        for block in &referenced_blocks {
            match block_data.get(&block.hash) {
                Some(data) => {
                    new_blocks.push((block.hash.clone(), data.clone()));
                    index_entries.push(DindexBlockEntry { hash: block.hash.clone(), size: block.size });
                    copied_blocks.push(block);
                }
                None => {
                    // The catalog believes this block lives here but its bytes aren't in the
                    // decoded container. Abort this candidate's rewrite rather than repoint the
                    // block to a volume that never received it and delete the only copy.
                    return Err(crate::error::IntegrityError::BlockMissingFromVolume {
                        hash: block.hash.clone(),
                        volume: candidate.name.clone(),
                    }
                    .into());
                }
            }
        }

        let manifest = VolumeManifest {
            version: 1,
            created: chrono::Utc::now(),
            encoding: "utf8".into(),
            blocksize: 0,
            block_hash: "blake3".into(),
            file_hash: "blake3".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
        };
        let dblock_container = volume::encode_dblock(&manifest, &new_blocks)?;
        let dblock_packed = volume::pack(
            dblock_container,
            options.compression,
            options.compression_level,
            options.password.as_deref(),
        )?;

        let created = chrono::Utc::now();
        let dblock_name = catalog.probe_unused_filename(|| {
            VolumeName::new(&options.prefix, VolumeKind::DBlock, created, options.compression, options.password.is_some())
                .to_file_name()
        })?;

        let dindex_container = volume::encode_dindex(&manifest, &dblock_name, &index_entries, &[])?;
        let dindex_packed = volume::pack(
            dindex_container,
            options.compression,
            options.compression_level,
            options.password.as_deref(),
        )?;
        let dindex_name = catalog.probe_unused_filename(|| {
            VolumeName::new(&options.prefix, VolumeKind::DIndex, created, options.compression, options.password.is_some())
                .to_file_name()
        })?;

        let new_dblock_id = catalog.create_remote_volume(&dblock_name, VolumeKind::DBlock, dblock_packed.len() as u64)?;
        let new_dindex_id = catalog.create_remote_volume(&dindex_name, VolumeKind::DIndex, dindex_packed.len() as u64)?;
        catalog.update_remote_volume(new_dblock_id, crate::model::VolumeState::Uploading, None)?;
        catalog.update_remote_volume(new_dindex_id, crate::model::VolumeState::Uploading, None)?;

        for block in &copied_blocks {
            catalog.set_block_volume(block.id, new_dblock_id)?;
        }
        catalog.update_remote_volume(candidate.volume_id, crate::model::VolumeState::Deleting, None)?;

        if let Some(queue) = queue {
            queue.upload(dblock_name, dblock_packed).await?;
            catalog.update_remote_volume(new_dblock_id, crate::model::VolumeState::Uploaded, None)?;
            queue.upload(dindex_name, dindex_packed).await?;
            catalog.update_remote_volume(new_dindex_id, crate::model::VolumeState::Uploaded, None)?;
            queue.delete(candidate.name.clone()).await?;
            queue.wait_for_empty().await?;
        }

        report.volumes_rewritten += 1;
        report.bytes_reclaimed += candidate.total_size - candidate.referenced_size;
        info!(old_volume = %candidate.name, new_volume = %dblock_name, "compact rewrote volume");
    }

    progress.emit(Phase::Compact, 1.0);
    Ok(report)
}

fn find_candidates(catalog: &Catalog, options: &CompactOptions) -> Result<Vec<Candidate>> {
    let volumes = catalog.list_remote_volumes(Some(crate::model::VolumeState::Uploaded))?;
    let mut verified = catalog.list_remote_volumes(Some(crate::model::VolumeState::Verified))?;
    let mut all = volumes;
    all.append(&mut verified);

    let mut candidates = Vec::new();
    for volume in all {
        if volume.kind != VolumeKind::DBlock {
            continue;
        }
        let (total_size, referenced_size) = catalog.volume_reference_stats(volume.id)?;
        if total_size == 0 {
            continue;
        }
        let fraction = referenced_size as f64 / total_size as f64;
        let wasted = total_size - referenced_size;
        if fraction < options.wasted_threshold || wasted > options.wasted_bytes_threshold {
            candidates.push(Candidate {
                volume_id: volume.id,
                name: volume.name,
                referenced_fraction: fraction,
                total_size,
                referenced_size,
            });
        }
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileKind, VolumeState};
    use crate::progress;

    #[tokio::test]
    async fn zero_reference_volume_is_deleted_without_rewrite() {
        let mut cat = Catalog::open_in_memory().unwrap();
        let volume_id = cat.create_remote_volume("old.zip.aes", VolumeKind::DBlock, 1000).unwrap();
        cat.update_remote_volume(volume_id, VolumeState::Uploading, None).unwrap();
        cat.update_remote_volume(volume_id, VolumeState::Uploaded, Some("h")).unwrap();

        let block_id = cat.intern_block("h1", 1000).unwrap();
        cat.set_block_volume(block_id, volume_id).unwrap();
        // No blockset references the block: it is fully unreferenced.

        let options = CompactOptions::default();
        let (sink, _rx) = progress::channel();
        let report = run_compact(&mut cat, None, &options, &sink).await.unwrap();
        assert_eq!(report.volumes_deleted_outright, 1);
        assert_eq!(report.volumes_rewritten, 0);

        let row = cat.get_remote_volume(volume_id).unwrap().unwrap();
        assert_eq!(row.state, VolumeState::Deleting);
    }

    #[tokio::test]
    async fn fully_referenced_volume_is_not_a_candidate() {
        let mut cat = Catalog::open_in_memory().unwrap();
        let volume_id = cat.create_remote_volume("old.zip.aes", VolumeKind::DBlock, 1000).unwrap();
        cat.update_remote_volume(volume_id, VolumeState::Uploading, None).unwrap();
        cat.update_remote_volume(volume_id, VolumeState::Uploaded, Some("h")).unwrap();

        let block_id = cat.intern_block("h1", 1000).unwrap();
        cat.set_block_volume(block_id, volume_id).unwrap();
        cat.intern_blockset("bs1", 1000, &[(block_id, "h1".into(), 1000)]).unwrap();
        let mut temp = cat.create_temporary_fileset(chrono::Utc::now(), true).unwrap();
        temp.push(crate::catalog::TempFilesetEntry {
            path: "a.txt".into(),
            kind: FileKind::File,
            content_blockset_id: Some(1),
            metadata_blockset_id: None,
            modified: chrono::Utc::now(),
            lastmodified: false,
        });
        cat.write_fileset(temp).unwrap();

        let options = CompactOptions::default();
        let (sink, _rx) = progress::channel();
        let report = run_compact(&mut cat, None, &options, &sink).await.unwrap();
        assert_eq!(report.volumes_deleted_outright, 0);
        assert_eq!(report.volumes_rewritten, 0);
    }

    struct StubStore {
        blobs: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl crate::object_store::ObjectStore for StubStore {
        async fn put(&self, name: &str, data: Vec<u8>) -> Result<()> {
            self.blobs.lock().unwrap().insert(name.to_string(), data);
            Ok(())
        }
        async fn get(&self, name: &str) -> Result<Vec<u8>> {
            self.blobs
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("not found").into())
        }
        async fn delete(&self, name: &str) -> Result<()> {
            self.blobs.lock().unwrap().remove(name);
            Ok(())
        }
        async fn list(&self) -> Result<Vec<crate::object_store::ObjectMeta>> {
            Ok(self
                .blobs
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| crate::object_store::ObjectMeta { name: k.clone(), size: v.len() as u64 })
                .collect())
        }
    }

    #[tokio::test]
    async fn missing_block_aborts_rewrite_instead_of_losing_data() {
        let mut cat = Catalog::open_in_memory().unwrap();
        let volume_id = cat.create_remote_volume("old.zip", VolumeKind::DBlock, 1000).unwrap();
        cat.update_remote_volume(volume_id, VolumeState::Uploading, None).unwrap();
        cat.update_remote_volume(volume_id, VolumeState::Uploaded, Some("h")).unwrap();

        // h1 is referenced by a blockset; h2 merely shares the volume so the
        // referenced fraction (100/1000) clears the default candidate threshold.
        let h1 = cat.intern_block("h1", 100).unwrap();
        let h2 = cat.intern_block("h2", 900).unwrap();
        cat.set_block_volume(h1, volume_id).unwrap();
        cat.set_block_volume(h2, volume_id).unwrap();
        cat.intern_blockset("bs1", 100, &[(h1, "h1".into(), 100)]).unwrap();
        let mut temp = cat.create_temporary_fileset(chrono::Utc::now(), true).unwrap();
        temp.push(crate::catalog::TempFilesetEntry {
            path: "a.txt".into(),
            kind: FileKind::File,
            content_blockset_id: Some(1),
            metadata_blockset_id: None,
            modified: chrono::Utc::now(),
            lastmodified: false,
        });
        cat.write_fileset(temp).unwrap();

        // The backend's actual container never holds h1's bytes, only h2's —
        // simulating a catalog/backend that have already diverged.
        let manifest = VolumeManifest {
            version: 1,
            created: chrono::Utc::now(),
            encoding: "utf8".into(),
            blocksize: 0,
            block_hash: "blake3".into(),
            file_hash: "blake3".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
        };
        let container = volume::encode_dblock(&manifest, &[("h2".into(), vec![0u8; 900])]).unwrap();
        let packed = volume::pack(container, CompressionKind::Zstd, 3, None).unwrap();
        let store = std::sync::Arc::new(StubStore { blobs: std::sync::Mutex::new(std::collections::HashMap::from([("old.zip".to_string(), packed)])) });
        let queue = VolumeQueue::spawn(store, None);

        let options = CompactOptions::default();
        let (sink, _rx) = progress::channel();
        let err = run_compact(&mut cat, Some(&queue), &options, &sink).await.unwrap_err();
        assert!(err.to_string().contains("h1"));

        // The old volume must not have been touched: its blob and state survive.
        let row = cat.get_remote_volume(volume_id).unwrap().unwrap();
        assert_eq!(row.state, VolumeState::Uploaded);
    }
}
