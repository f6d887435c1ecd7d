//! # Volume Codec
//!
//! Encodes and decodes the three remote blob kinds — *dblock* (raw data
//! blocks), *dindex* (block-to-dblock index), *dfileset* (snapshot manifest)
//! — through a compress-then-encrypt pipeline (spec.md §4.2, §6).
//!
//! Each container is a zip-like archive whose entries are stored
//! uncompressed (`CompressionMethod::Stored`): the archive format only
//! frames named entries. The actual compression and encryption wrap the
//! *entire* archive byte stream afterwards, matching the design's "whole
//! container is compressed then encrypted as a single stream."

use crate::compress::{self, extension};
use crate::config::CompressionKind;
use crate::crypto;
use crate::error::{CoreError, Result};
use crate::model::{FileKind, VolumeKind};
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// The manifest JSON document embedded as the first entry of every container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeManifest {
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,
    #[serde(rename = "Encoding")]
    pub encoding: String,
    #[serde(rename = "Blocksize")]
    pub blocksize: u64,
    #[serde(rename = "BlockHash")]
    pub block_hash: String,
    #[serde(rename = "FileHash")]
    pub file_hash: String,
    #[serde(rename = "AppVersion")]
    pub app_version: String,
}

/// One entry in a dfileset's structured file list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesetFileEntry {
    pub path: String,
    pub kind: FileKind,
    pub content_blockset_hash: Option<String>,
    pub metadata_blockset_hash: Option<String>,
    pub modified: DateTime<Utc>,
    pub lastmodified: bool,
}

/// One dblock volume's worth of block metadata as recorded by its dindex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DindexBlockEntry {
    pub hash: String,
    pub size: u64,
}

/// A long blockset recorded compactly in a dindex, rather than spelled out
/// in every dfileset that references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistHashEntry {
    pub blockset_hash: String,
    pub block_hashes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DindexList {
    volume: String,
    blocks: Vec<DindexBlockEntry>,
    blocklist_hashes: Vec<BlocklistHashEntry>,
}

/// Parsed `{prefix}-{random6}-{kind}-{yyyyMMddTHHmmssZ}.{compressor}.{encrypter}`
/// filename (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    pub prefix: String,
    pub kind: VolumeKind,
    pub created: DateTime<Utc>,
    pub random: String,
    pub compressor: String,
    pub encrypter: String,
}

impl VolumeName {
    /// Builds a new, randomly-suffixed volume name for `created`.
    pub fn new(
        prefix: &str,
        kind: VolumeKind,
        created: DateTime<Utc>,
        compressor: CompressionKind,
        encrypted: bool,
    ) -> Self {
        VolumeName {
            prefix: prefix.to_string(),
            kind,
            created,
            random: random_suffix(),
            compressor: extension(compressor).to_string(),
            encrypter: if encrypted { "aes".to_string() } else { "noenc".to_string() },
        }
    }

    pub fn to_file_name(&self) -> String {
        format!(
            "{}-{}-{}-{}.{}.{}",
            self.prefix,
            self.random,
            self.kind.letter(),
            self.created.format("%Y%m%dT%H%M%SZ"),
            self.compressor,
            self.encrypter,
        )
    }

    /// Parses a filename produced by [`VolumeName::to_file_name`].
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || CoreError::Other(anyhow::anyhow!("not a volume filename: {name}"));

        let mut dot_parts = name.splitn(3, '.');
        let stem = dot_parts.next().ok_or_else(invalid)?;
        let compressor = dot_parts.next().ok_or_else(invalid)?.to_string();
        let encrypter = dot_parts.next().ok_or_else(invalid)?.to_string();

        let segments: Vec<&str> = stem.split('-').collect();
        if segments.len() < 4 {
            return Err(invalid());
        }
        let timestamp_str = segments[segments.len() - 1];
        let kind_str = segments[segments.len() - 2];
        let random = segments[segments.len() - 3];
        let prefix = segments[..segments.len() - 3].join("-");

        let kind = kind_str
            .chars()
            .next()
            .and_then(VolumeKind::from_letter)
            .ok_or_else(invalid)?;

        let naive = chrono::NaiveDateTime::parse_from_str(timestamp_str, "%Y%m%dT%H%M%SZ")
            .map_err(|_| invalid())?;
        let created = Utc.from_utc_datetime(&naive);

        Ok(VolumeName {
            prefix,
            kind,
            created,
            random: random.to_string(),
            compressor,
            encrypter,
        })
    }
}

fn random_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// base64url (no padding) of a hex content hash, used as zip entry names.
fn entry_name_for_hash(hash: &str) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(hash.as_bytes())
}

fn hash_from_entry_name(entry: &str) -> Result<String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let bytes = URL_SAFE_NO_PAD
        .decode(entry)
        .map_err(|e| anyhow::anyhow!("invalid dblock entry name '{entry}': {e}"))?;
    String::from_utf8(bytes).map_err(|e| anyhow::anyhow!("invalid dblock entry name '{entry}': {e}").into())
}

fn write_manifest_entry(zip: &mut ZipWriter<Cursor<Vec<u8>>>, manifest: &VolumeManifest) -> Result<()> {
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    zip.start_file("manifest", options)?;
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| anyhow::anyhow!(e))?;
    zip.write_all(&json)?;
    Ok(())
}

fn read_manifest_entry(zip: &mut ZipArchive<Cursor<Vec<u8>>>) -> Result<VolumeManifest> {
    let mut file = zip.by_name("manifest")?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    serde_json::from_slice(&buf).map_err(|e| anyhow::anyhow!("malformed manifest entry: {e}").into())
}

/// Encodes a dblock volume: one entry per block, named by base64url(hash).
pub fn encode_dblock(manifest: &VolumeManifest, blocks: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let cursor = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(cursor);
    write_manifest_entry(&mut zip, manifest)?;

    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    for (hash, data) in blocks {
        zip.start_file(entry_name_for_hash(hash), options)?;
        zip.write_all(data)?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Decodes a dblock volume, returning its manifest and `(hash, data)` pairs.
pub fn decode_dblock(container: &[u8]) -> Result<(VolumeManifest, Vec<(String, Vec<u8>)>)> {
    let cursor = Cursor::new(container.to_vec());
    let mut zip = ZipArchive::new(cursor)?;
    let manifest = read_manifest_entry(&mut zip)?;

    let mut blocks = Vec::new();
    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        if file.name() == "manifest" {
            continue;
        }
        let hash = hash_from_entry_name(file.name())?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        blocks.push((hash, data));
    }
    Ok((manifest, blocks))
}

/// Encodes a dindex volume: the block list for one dblock volume, plus any
/// blocklist-hash entries for long blocksets it backs.
pub fn encode_dindex(
    manifest: &VolumeManifest,
    dblock_name: &str,
    blocks: &[DindexBlockEntry],
    blocklist_hashes: &[BlocklistHashEntry],
) -> Result<Vec<u8>> {
    let cursor = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(cursor);
    write_manifest_entry(&mut zip, manifest)?;

    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    zip.start_file("list.json", options)?;
    let list = DindexList {
        volume: dblock_name.to_string(),
        blocks: blocks.to_vec(),
        blocklist_hashes: blocklist_hashes.to_vec(),
    };
    zip.write_all(&serde_json::to_vec_pretty(&list).map_err(|e| anyhow::anyhow!(e))?)?;

    Ok(zip.finish()?.into_inner())
}

/// Decodes a dindex volume.
pub fn decode_dindex(
    container: &[u8],
) -> Result<(VolumeManifest, String, Vec<DindexBlockEntry>, Vec<BlocklistHashEntry>)> {
    let cursor = Cursor::new(container.to_vec());
    let mut zip = ZipArchive::new(cursor)?;
    let manifest = read_manifest_entry(&mut zip)?;

    let mut file = zip.by_name("list.json")?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let list: DindexList = serde_json::from_slice(&buf).map_err(|e| anyhow::anyhow!(e))?;

    Ok((manifest, list.volume, list.blocks, list.blocklist_hashes))
}

/// Encodes a dfileset volume: the `files` plain listing and the structured
/// `filelist.json` entry (spec.md §4.2).
pub fn encode_dfileset(manifest: &VolumeManifest, files: &[FilesetFileEntry]) -> Result<Vec<u8>> {
    let cursor = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(cursor);
    write_manifest_entry(&mut zip, manifest)?;

    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file("files", options)?;
    let plain: String = files
        .iter()
        .map(|f| f.path.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    zip.write_all(plain.as_bytes())?;

    zip.start_file("filelist.json", options)?;
    zip.write_all(&serde_json::to_vec_pretty(files).map_err(|e| anyhow::anyhow!(e))?)?;

    Ok(zip.finish()?.into_inner())
}

/// Decodes a dfileset volume, returning its manifest and structured file list.
pub fn decode_dfileset(container: &[u8]) -> Result<(VolumeManifest, Vec<FilesetFileEntry>)> {
    let cursor = Cursor::new(container.to_vec());
    let mut zip = ZipArchive::new(cursor)?;
    let manifest = read_manifest_entry(&mut zip)?;

    let mut file = zip.by_name("filelist.json")?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let files: Vec<FilesetFileEntry> = serde_json::from_slice(&buf).map_err(|e| anyhow::anyhow!(e))?;

    Ok((manifest, files))
}

/// Compresses then (optionally) encrypts a raw container into the bytes that
/// are actually uploaded to the backend.
pub fn pack(container: Vec<u8>, compression: CompressionKind, level: i32, password: Option<&str>) -> Result<Vec<u8>> {
    let compressed = compress::compress(&container, compression, level)?;
    match password {
        Some(pw) => crypto::encrypt(&compressed, pw),
        None => Ok(compressed),
    }
}

/// Reverses [`pack`]: decrypts then decompresses backend bytes into a raw container.
pub fn unpack(data: &[u8], compression: CompressionKind, password: Option<&str>) -> Result<Vec<u8>> {
    let compressed = match password {
        Some(pw) => crypto::decrypt(data, pw)?,
        None => data.to_vec(),
    };
    compress::decompress(&compressed, compression)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manifest() -> VolumeManifest {
        VolumeManifest {
            version: 1,
            created: Utc::now(),
            encoding: "utf8".into(),
            blocksize: 100 * 1024,
            block_hash: "blake3".into(),
            file_hash: "blake3".into(),
            app_version: "test".into(),
        }
    }

    #[test]
    fn dblock_roundtrip_r2() {
        let manifest = test_manifest();
        let blocks = vec![
            ("aaaa".to_string(), b"hello".to_vec()),
            ("bbbb".to_string(), b"world!!".to_vec()),
        ];
        let encoded = encode_dblock(&manifest, &blocks).unwrap();
        let (decoded_manifest, decoded_blocks) = decode_dblock(&encoded).unwrap();
        assert_eq!(decoded_manifest.blocksize, manifest.blocksize);

        let mut sorted = decoded_blocks;
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut expected = blocks;
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(sorted, expected);
    }

    #[test]
    fn dindex_roundtrip_r2() {
        let manifest = test_manifest();
        let blocks = vec![DindexBlockEntry { hash: "aaaa".into(), size: 100 }];
        let blocklists = vec![BlocklistHashEntry {
            blockset_hash: "zzzz".into(),
            block_hashes: vec!["aaaa".into(), "bbbb".into()],
        }];
        let encoded = encode_dindex(&manifest, "dblock-name.zip.noenc", &blocks, &blocklists).unwrap();
        let (_, volume, decoded_blocks, decoded_blocklists) = decode_dindex(&encoded).unwrap();
        assert_eq!(volume, "dblock-name.zip.noenc");
        assert_eq!(decoded_blocks, blocks);
        assert_eq!(decoded_blocklists, blocklists);
    }

    #[test]
    fn dfileset_roundtrip_r2() {
        let manifest = test_manifest();
        let files = vec![FilesetFileEntry {
            path: "docs/a.txt".into(),
            kind: FileKind::File,
            content_blockset_hash: Some("cccc".into()),
            metadata_blockset_hash: None,
            modified: Utc::now(),
            lastmodified: false,
        }];
        let encoded = encode_dfileset(&manifest, &files).unwrap();
        let (_, decoded) = decode_dfileset(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].path, "docs/a.txt");
    }

    #[test]
    fn pack_unpack_roundtrip_with_encryption() {
        let data = b"some container bytes to protect".to_vec();
        let packed = pack(data.clone(), CompressionKind::Zstd, 3, Some("pw")).unwrap();
        let unpacked = unpack(&packed, CompressionKind::Zstd, Some("pw")).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn pack_unpack_roundtrip_without_encryption() {
        let data = b"plain container bytes".to_vec();
        let packed = pack(data.clone(), CompressionKind::Zstd, 3, None).unwrap();
        let unpacked = unpack(&packed, CompressionKind::Zstd, None).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn volume_name_roundtrip() {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let name = VolumeName::new("repocore", VolumeKind::DBlock, created, CompressionKind::Zstd, true);
        let file_name = name.to_file_name();
        assert!(file_name.starts_with("repocore-"));
        assert!(file_name.contains("-b-20250101T120000Z."));

        let parsed = VolumeName::parse(&file_name).unwrap();
        assert_eq!(parsed.kind, VolumeKind::DBlock);
        assert_eq!(parsed.created, created);
        assert_eq!(parsed.prefix, "repocore");
    }
}
