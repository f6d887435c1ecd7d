//! # Restore Engine
//!
//! Reconstructs files from a fileset by reading their blocksets, fetching
//! each block's owning dblock volume from the backend, decompressing and
//! optionally decrypting it, and writing the reassembled content to the
//! target directory.
//!
//! Dblock volumes are cached in memory per restore run, keyed by catalog
//! volume id, so a volume backing many blocks across many files is only
//! fetched and unpacked once.

use crate::catalog::SharedCatalog;
use crate::config::Settings;
use crate::error::{CoreError, IntegrityError, Result, UserInputError};
use crate::hasher;
use crate::model::FileKind;
use crate::object_store::ObjectStore;
use crate::progress::{Phase, ProgressSink};
use crate::volume;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Options controlling restore behavior.
pub struct RestoreOptions<'a> {
    /// Target directory to restore files into.
    pub target_dir: PathBuf,

    /// Password for decrypting volumes, if the repository is encrypted.
    pub password: Option<&'a str>,

    /// If true, overwrite an existing non-empty target directory.
    pub force: bool,

    /// If true, re-hash each block and the assembled file against the
    /// catalog's recorded hashes before writing.
    pub verify: bool,

    /// If set, only restore files whose path starts with or contains one
    /// of these strings.
    pub filter: Option<Vec<String>>,

    pub verbose: bool,
}

/// Statistics from a restore run.
#[derive(Debug, Default)]
pub struct RestoreStats {
    pub files_restored: u64,
    pub bytes_restored: u64,
}

/// Restores every file in `fileset_id` into `opts.target_dir` (spec.md §3).
pub async fn restore_fileset(
    catalog: &SharedCatalog,
    store: &Arc<dyn ObjectStore>,
    settings: &Settings,
    fileset_id: i64,
    opts: &RestoreOptions<'_>,
    progress: &ProgressSink,
) -> Result<RestoreStats> {
    if opts.target_dir.exists() && !opts.force {
        let is_empty = opts
            .target_dir
            .read_dir()
            .map(|mut d| d.next().is_none())
            .unwrap_or(false);
        if !is_empty {
            return Err(UserInputError::TargetNotEmpty(opts.target_dir.clone()).into());
        }
    }
    std::fs::create_dir_all(&opts.target_dir)?;

    let entries = {
        let cat = catalog.lock().map_err(|_| anyhow::anyhow!("catalog mutex poisoned"))?;
        cat.fileset_entries(fileset_id)?
    };

    let entries: Vec<_> = entries
        .into_iter()
        .filter(|(file, _)| {
            opts.filter.as_ref().map_or(true, |filters| {
                filters.iter().any(|f| file.path.starts_with(f) || file.path.contains(f))
            })
        })
        .collect();

    let total = entries.len() as u64;
    let mut stats = RestoreStats::default();
    let mut volume_cache: HashMap<i64, HashMap<String, Vec<u8>>> = HashMap::new();
    let password = if settings.encrypt { opts.password } else { None };

    for (index, (file, _fileset_entry)) in entries.iter().enumerate() {
        progress.emit(Phase::Restore, index as f64 / total.max(1) as f64);

        let target_path = opts.target_dir.join(&file.path);

        if file.kind == FileKind::Folder {
            std::fs::create_dir_all(&target_path)?;
            continue;
        }

        let Some(blockset_id) = file.content_blockset_id else {
            continue;
        };
        let blockset = {
            let cat = catalog.lock().map_err(|_| anyhow::anyhow!("catalog mutex poisoned"))?;
            cat.get_blockset(blockset_id)?
                .ok_or_else(|| anyhow::anyhow!("blockset {blockset_id} referenced by file but missing from catalog"))?
        };

        let mut file_data = Vec::with_capacity(blockset.length as usize);
        let mut chunk_hashes = Vec::with_capacity(blockset.blocks.len());

        for block_ref in &blockset.blocks {
            let volume_id = {
                let cat = catalog.lock().map_err(|_| anyhow::anyhow!("catalog mutex poisoned"))?;
                cat.block_volume(block_ref.block_id)?.ok_or_else(|| {
                    anyhow::anyhow!("block {} has no owning volume recorded", block_ref.hash)
                })?
            };

            if !volume_cache.contains_key(&volume_id) {
                let name = {
                    let cat = catalog.lock().map_err(|_| anyhow::anyhow!("catalog mutex poisoned"))?;
                    cat.get_remote_volume(volume_id)?
                        .ok_or_else(|| anyhow::anyhow!("remote volume {volume_id} missing from catalog"))?
                        .name
                };
                let packed = store.get(&name).await?;
                let container = volume::unpack(&packed, settings.compression, password)?;
                let (_, blocks) = volume::decode_dblock(&container)?;
                volume_cache.insert(volume_id, blocks.into_iter().collect());
            }

            let data = volume_cache[&volume_id].get(&block_ref.hash).ok_or_else(|| {
                CoreError::Integrity(IntegrityError::BlobMissing { name: block_ref.hash.clone() })
            })?;

            if opts.verify {
                let actual = hasher::hash_bytes(data);
                if actual != block_ref.hash {
                    return Err(IntegrityError::ContentMismatch {
                        path: file.path.clone(),
                        expected: block_ref.hash.clone(),
                        actual,
                    }
                    .into());
                }
            }

            chunk_hashes.push(block_ref.hash.clone());
            file_data.extend_from_slice(data);
        }

        if opts.verify {
            let full_hash = hasher::hash_bytes(chunk_hashes.join(",").as_bytes());
            if full_hash != blockset.full_hash {
                return Err(IntegrityError::ContentMismatch {
                    path: file.path.clone(),
                    expected: blockset.full_hash.clone(),
                    actual: full_hash,
                }
                .into());
            }
        }

        if let Some(parent) = target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target_path, &file_data)?;

        stats.files_restored += 1;
        stats.bytes_restored += file_data.len() as u64;

        if opts.verbose {
            eprintln!("  restored {}", file.path);
        }
    }

    progress.emit(Phase::Restore, 1.0);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, TempFilesetEntry};
    use crate::config::{BackendSettings, CompressionKind, PurgeSettings};
    use crate::object_store::LocalFsStore;
    use crate::volume::{DindexBlockEntry, VolumeManifest};
    use chrono::Utc;
    use std::sync::Mutex;

    fn test_settings() -> Settings {
        Settings {
            interval: 300,
            blocksize: 1024,
            block_hash: "blake3".into(),
            file_hash: "blake3".into(),
            compression: CompressionKind::Zstd,
            zstd_level: 3,
            encrypt: false,
            max_snapshots: 0,
            repo_path: std::path::PathBuf::from(".repocore"),
            purge: PurgeSettings::default(),
            backend: BackendSettings::default(),
        }
    }

    fn test_manifest() -> VolumeManifest {
        VolumeManifest {
            version: 1,
            created: Utc::now(),
            encoding: "utf8".into(),
            blocksize: 1024,
            block_hash: "blake3".into(),
            file_hash: "blake3".into(),
            app_version: "test".into(),
        }
    }

    #[tokio::test]
    async fn restore_fileset_writes_back_original_bytes() {
        let settings = test_settings();
        let store_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::new(store_dir.path()).unwrap());

        let catalog: SharedCatalog = Arc::new(Mutex::new(Catalog::open_in_memory().unwrap()));

        let content = b"hello restore world".to_vec();
        let hash = hasher::hash_bytes(&content);

        let (dblock_name, dblock_id, blockset_id) = {
            let cat = catalog.lock().unwrap();
            let block_id = cat.intern_block(&hash, content.len() as u64).unwrap();
            let blockset_id = cat
                .intern_blockset(&hash, content.len() as u64, &[(block_id, hash.clone(), content.len() as u64)])
                .unwrap();

            let manifest = test_manifest();
            let dblock = volume::encode_dblock(&manifest, &[(hash.clone(), content.clone())]).unwrap();
            let packed = volume::pack(dblock, settings.compression, settings.zstd_level, None).unwrap();
            let dblock_name = "repocore-abcdef-b-20250101T000000Z.zip.noenc".to_string();
            let dblock_id = cat.create_remote_volume(&dblock_name, crate::model::VolumeKind::DBlock, packed.len() as u64).unwrap();
            cat.set_block_volume(block_id, dblock_id).unwrap();

            let _index = DindexBlockEntry { hash: hash.clone(), size: content.len() as u64 };
            store.put(&dblock_name, packed).await.unwrap();

            (dblock_name, dblock_id, blockset_id)
        };
        let _ = (dblock_name, dblock_id);

        let fileset_id = {
            let mut cat = catalog.lock().unwrap();
            let mut temp = cat.create_temporary_fileset(Utc::now(), true).unwrap();
            temp.push(TempFilesetEntry {
                path: "greeting.txt".into(),
                kind: FileKind::File,
                content_blockset_id: Some(blockset_id),
                metadata_blockset_id: None,
                modified: Utc::now(),
                lastmodified: false,
            });
            cat.write_fileset(temp).unwrap()
        };

        let target = tempfile::tempdir().unwrap();
        let opts = RestoreOptions {
            target_dir: target.path().to_path_buf(),
            password: None,
            force: false,
            verify: true,
            filter: None,
            verbose: false,
        };
        let (sink, _rx) = crate::progress::channel();

        let stats = restore_fileset(&catalog, &store, &settings, fileset_id, &opts, &sink).await.unwrap();
        assert_eq!(stats.files_restored, 1);

        let restored = std::fs::read(target.path().join("greeting.txt")).unwrap();
        assert_eq!(restored, content);
    }

    #[tokio::test]
    async fn restore_rejects_non_empty_target_without_force() {
        let settings = test_settings();
        let store_dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFsStore::new(store_dir.path()).unwrap());
        let catalog: SharedCatalog = Arc::new(Mutex::new(Catalog::open_in_memory().unwrap()));

        let fileset_id = {
            let mut cat = catalog.lock().unwrap();
            let temp = cat.create_temporary_fileset(Utc::now(), true).unwrap();
            cat.write_fileset(temp).unwrap()
        };

        let target = tempfile::tempdir().unwrap();
        std::fs::write(target.path().join("existing.txt"), b"keep me").unwrap();

        let opts = RestoreOptions {
            target_dir: target.path().to_path_buf(),
            password: None,
            force: false,
            verify: false,
            filter: None,
            verbose: false,
        };
        let (sink, _rx) = crate::progress::channel();

        let err = restore_fileset(&catalog, &store, &settings, fileset_id, &opts, &sink).await.unwrap_err();
        assert!(matches!(err, CoreError::UserInput(UserInputError::TargetNotEmpty(_))));
    }
}
