//! # Content Hashing & Chunking
//!
//! Uses BLAKE3 for fast, cryptographically secure content hashing. BLAKE3 is
//! significantly faster than SHA-256 (especially with SIMD), making it ideal
//! for hashing large backup sets where thousands of files need deduplication.
//!
//! Files are split into fixed-size blocks (see spec.md §3); each block's hash
//! is used as the content-addressable key in the dblock volumes, and the
//! whole-file hash is retained on the blockset for quick integrity checks.

use crate::error::{CoreError, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Size of the read buffer for streaming hash computation (64 KiB).
const BUF_SIZE: usize = 64 * 1024;

/// A single chunk read from a file during backup: position, bytes, and hash.
pub struct Chunk {
    pub ordinal: i64,
    pub data: Vec<u8>,
    pub hash: String,
}

/// Splits a file into fixed-size chunks, hashing each as it is read.
///
/// The final chunk may be shorter than `blocksize`; every earlier chunk is
/// exactly `blocksize` bytes, satisfying the blockset length invariant (P2).
pub fn chunk_file(path: &Path, blocksize: u64) -> Result<Vec<Chunk>> {
    let mut file = File::open(path)?;
    let blocksize = blocksize.max(1) as usize;
    let mut chunks = Vec::new();
    let mut buf = vec![0u8; blocksize];
    let mut ordinal = 0i64;

    loop {
        let mut filled = 0;
        while filled < blocksize {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let data = buf[..filled].to_vec();
        let hash = hash_bytes(&data);
        chunks.push(Chunk {
            ordinal,
            data,
            hash,
        });
        ordinal += 1;
        if filled < blocksize {
            break;
        }
    }

    Ok(chunks)
}

/// Computes the BLAKE3 hash of a file's entire contents, returning a hex string.
///
/// Uses streaming reads to handle arbitrarily large files without loading
/// the entire contents into memory.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let bytes_read = file.read(&mut buf).map_err(CoreError::Io)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buf[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Computes the BLAKE3 hash of in-memory data.
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Returns the first `n` characters of a hash for display purposes.
pub fn short_hash(hash: &str, n: usize) -> &str {
    &hash[..n.min(hash.len())]
}

/// Splits a hash into a 2-char prefix and remaining suffix for directory sharding.
///
/// Content-addressable stores use this to avoid placing millions of files in a
/// single directory, which degrades filesystem performance on ext4/NTFS.
pub fn shard_path(hash: &str) -> (&str, &str) {
    hash.split_at(2.min(hash.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("repocore-test-{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn hash_deterministic() {
        let path = scratch_file("hash-det", b"hello world");
        let h1 = hash_file(&path).unwrap();
        let h2 = hash_file(&path).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_bytes_different_inputs() {
        assert_ne!(hash_bytes(b"data A"), hash_bytes(b"data B"));
    }

    #[test]
    fn shard_split() {
        let (prefix, suffix) = shard_path("a1b2c3d4e5f6");
        assert_eq!(prefix, "a1");
        assert_eq!(suffix, "b2c3d4e5f6");
    }

    #[test]
    fn chunking_produces_exact_blocksize_prefix_and_short_tail() {
        let data = vec![7u8; 250];
        let path = scratch_file("chunk-tail", &data);
        let chunks = chunk_file(&path, 100).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data.len(), 100);
        assert_eq!(chunks[1].data.len(), 100);
        assert_eq!(chunks[2].data.len(), 50);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[2].ordinal, 2);
    }

    #[test]
    fn chunking_exact_multiple_has_no_extra_empty_tail() {
        let data = vec![1u8; 200];
        let path = scratch_file("chunk-exact", &data);
        let chunks = chunk_file(&path, 100).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.data.len() == 100));
    }

    #[test]
    fn chunking_empty_file_has_no_chunks() {
        let path = scratch_file("chunk-empty", b"");
        let chunks = chunk_file(&path, 100).unwrap();
        assert!(chunks.is_empty());
    }
}
