//! File-backed blob store.

use super::BlobStore;
use crate::error::{DbError, Result};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for blob files.
const BLOB_MAGIC: &[u8; 4] = b"LDB\0";

/// Current blob format version.
const BLOB_VERSION: u8 = 1;

/// Name of the lock file guarding the directory.
const LOCK_FILE: &str = "LOCK";

/// Blob store writing one file per key.
///
/// Files are named by the SHA-256 of the key and sharded into directories by
/// its first byte. Each file carries the key, the payload and a CRC32 of the
/// payload. The directory is locked exclusively while the store is open.
pub struct FileBlobStore {
    /// Base directory for blobs.
    path: PathBuf,

    /// LRU cache of recently read or written payloads.
    cache: Mutex<LruCache<String, Vec<u8>>>,

    _lock_file: File,
}

impl FileBlobStore {
    /// Open (creating if needed) a blob store at the given path.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = File::create(path.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|_| DbError::Locked)?;

        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the blob under `key`. Returns false if there was none.
    pub fn delete_blob(&self, key: &str) -> Result<bool> {
        self.cache.lock().pop(key);

        let blob_path = self.blob_path(key);
        if blob_path.exists() {
            fs::remove_file(&blob_path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// List all stored keys.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for blob_entry in fs::read_dir(entry.path())? {
                    let blob_path = blob_entry?.path();
                    // Interrupted writes leave .tmp files behind
                    if blob_path.extension().is_some() {
                        continue;
                    }
                    let (key, _) = read_blob_file(&blob_path)?;
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn key_hash(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    /// Get the full path for a key.
    fn blob_path(&self, key: &str) -> PathBuf {
        let hash = Self::key_hash(key);
        self.path.join(&hash[..2]).join(hash)
    }
}

fn read_blob_file(path: &Path) -> Result<(String, Vec<u8>)> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    // Read and verify magic
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != BLOB_MAGIC {
        return Err(DbError::InvalidFormat("Invalid blob magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != BLOB_VERSION {
        return Err(DbError::InvalidFormat(format!(
            "Unsupported blob version: {}",
            version[0]
        )));
    }

    // Read key
    let mut key_len_bytes = [0u8; 2];
    file.read_exact(&mut key_len_bytes)?;
    let key_len = u16::from_le_bytes(key_len_bytes) as usize;

    let mut key_bytes = vec![0u8; key_len];
    file.read_exact(&mut key_bytes)?;
    let key = String::from_utf8(key_bytes)
        .map_err(|_| DbError::InvalidFormat("Blob key is not UTF-8".into()))?;

    // Read payload
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);

    // Header, key and length field precede the payload; the checksum follows it.
    let remaining = file_len.saturating_sub(4 + 1 + 2 + key_len as u64 + 8);
    if len.checked_add(4).map_or(true, |needed| needed > remaining) {
        return Err(DbError::InvalidFormat(format!(
            "Blob payload length {} exceeds file size {}",
            len, file_len
        )));
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(&payload);

    if stored_checksum != computed_checksum {
        return Err(DbError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    Ok((key, payload))
}

impl BlobStore for FileBlobStore {
    fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.lock().get(key).cloned() {
            return Ok(Some(cached));
        }

        let blob_path = self.blob_path(key);
        if !blob_path.exists() {
            return Ok(None);
        }

        let (stored_key, payload) = read_blob_file(&blob_path)?;
        if stored_key != key {
            return Err(DbError::InvalidFormat(format!(
                "Blob file for {} holds key {}",
                key, stored_key
            )));
        }

        self.cache.lock().put(key.to_string(), payload.clone());
        Ok(Some(payload))
    }

    fn save_blob(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let key_bytes = key.as_bytes();
        let key_len = u16::try_from(key_bytes.len())
            .map_err(|_| DbError::InvalidFormat(format!("Blob key too long: {}", key)))?;

        let blob_path = self.blob_path(key);
        if let Some(shard_dir) = blob_path.parent() {
            fs::create_dir_all(shard_dir)?;
        }

        // Write to a sibling file, then rename over the old blob
        let tmp_path = blob_path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;

        file.write_all(BLOB_MAGIC)?;
        file.write_all(&[BLOB_VERSION])?;

        file.write_all(&key_len.to_le_bytes())?;
        file.write_all(key_bytes)?;

        file.write_all(&(bytes.len() as u64).to_le_bytes())?;
        file.write_all(bytes)?;

        let checksum = crc32fast::hash(bytes);
        file.write_all(&checksum.to_le_bytes())?;

        file.sync_all()?;
        fs::rename(&tmp_path, &blob_path)?;

        self.cache.lock().put(key.to_string(), bytes.to_vec());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_retrieve() {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(dir.path().join("blobs"), 100).unwrap();

        store.save_blob("person", b"{\"p1\":{}}").unwrap();
        assert_eq!(store.load_blob("person").unwrap().unwrap(), b"{\"p1\":{}}");
        assert!(store.load_blob("car").unwrap().is_none());
    }

    #[test]
    fn test_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(dir.path().join("blobs"), 100).unwrap();

        store.save_blob("person", b"one").unwrap();
        store.save_blob("person", b"two").unwrap();
        assert_eq!(store.load_blob("person").unwrap().unwrap(), b"two");
    }

    #[test]
    fn test_reopen_reads_from_disk() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileBlobStore::open(dir.path().join("blobs"), 100).unwrap();
            store.save_blob("person", b"persisted").unwrap();
        }

        let store = FileBlobStore::open(dir.path().join("blobs"), 0).unwrap();
        assert_eq!(store.load_blob("person").unwrap().unwrap(), b"persisted");
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileBlobStore::open(dir.path().join("blobs"), 100).unwrap();
            store.save_blob("person", b"payload").unwrap();
            let path = store.blob_path("person");
            let mut bytes = fs::read(&path).unwrap();
            let payload_start = bytes.len() - 4 - b"payload".len();
            bytes[payload_start] ^= 0xff;
            fs::write(&path, bytes).unwrap();
        }

        let store = FileBlobStore::open(dir.path().join("blobs"), 100).unwrap();
        assert!(matches!(
            store.load_blob("person"),
            Err(DbError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileBlobStore::open(dir.path().join("blobs"), 100).unwrap();
            store.save_blob("person", b"payload").unwrap();
            let path = store.blob_path("person");
            let mut bytes = fs::read(&path).unwrap();
            let len_start = 4 + 1 + 2 + b"person".len();
            bytes[len_start..len_start + 8].copy_from_slice(&u64::MAX.to_le_bytes());
            fs::write(&path, bytes).unwrap();
        }

        let store = FileBlobStore::open(dir.path().join("blobs"), 100).unwrap();
        assert!(matches!(
            store.load_blob("person"),
            Err(DbError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_keys_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::open(dir.path().join("blobs"), 100).unwrap();

        store.save_blob("b", b"2").unwrap();
        store.save_blob("a", b"1").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

        assert!(store.delete_blob("a").unwrap());
        assert!(!store.delete_blob("a").unwrap());
        assert!(store.load_blob("a").unwrap().is_none());
    }

    #[test]
    fn test_directory_lock() {
        let dir = TempDir::new().unwrap();
        let _store = FileBlobStore::open(dir.path().join("blobs"), 100).unwrap();
        let second = FileBlobStore::open(dir.path().join("blobs"), 100);
        assert!(matches!(second, Err(DbError::Locked)));
    }
}
