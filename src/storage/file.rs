//! File-backed durable storage.
//!
//! One file per page key, sharded by the first two hex digits of the key:
//! `<root>/3f/3fa9...e1.kvpage`. Each file is a fixed [`PageHeader`] followed
//! by the (optionally zstd-compressed) payload. Writes go to a uniquely named
//! temporary file in the same shard and are renamed into place, so readers
//! only ever see complete objects.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::compressor::{CompressionConfig, Compressor};
use super::{StorageBackend, StorageError};
use crate::cache::block::BlockKey;

const PAGE_MAGIC: u32 = 0x4843_5047; // "HCPG"
const PAGE_VERSION: u16 = 1;
const FLAG_ZSTD: u16 = 0x1;

/// On-disk header preceding every page payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PageHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    /// Payload length before compression.
    pub raw_len: u64,
    /// Key the object was written under.
    pub key: u64,
}

pub const HEADER_LEN: usize = std::mem::size_of::<PageHeader>();

/// Durable backend rooted at a directory.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    compressor: Compressor,
}

impl FileBackend {
    pub async fn new(root: impl Into<PathBuf>, compression: CompressionConfig) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened file storage backend");
        Ok(Self {
            root,
            compressor: Compressor::new(compression),
        })
    }

    /// Path of the object for `key`.
    pub fn object_path(&self, key: BlockKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..2]).join(format!("{hex}.kvpage"))
    }

    fn encode(&self, key: BlockKey, payload: &[u8]) -> Result<Vec<u8>, StorageError> {
        let encoded = self.compressor.compress(payload)?;
        let header = PageHeader {
            magic: PAGE_MAGIC,
            version: PAGE_VERSION,
            flags: if encoded.compressed { FLAG_ZSTD } else { 0 },
            raw_len: payload.len() as u64,
            key: key.0,
        };
        let mut out = Vec::with_capacity(HEADER_LEN + encoded.data.len());
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(&encoded.data);
        Ok(out)
    }

    fn decode(&self, key: BlockKey, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        let corrupt = |reason: &str| StorageError::Corrupt {
            key,
            reason: reason.to_string(),
        };
        if data.len() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }
        let header: PageHeader = bytemuck::pod_read_unaligned(&data[..HEADER_LEN]);
        if header.magic != PAGE_MAGIC {
            return Err(corrupt("bad magic"));
        }
        if header.version != PAGE_VERSION {
            return Err(corrupt("unsupported version"));
        }
        if header.key != key.0 {
            return Err(corrupt("key mismatch"));
        }
        let payload = self.compressor.decompress(
            &data[HEADER_LEN..],
            header.flags & FLAG_ZSTD != 0,
            header.raw_len as usize,
        )?;
        Ok(payload)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: BlockKey) -> Result<Option<Bytes>, StorageError> {
        let path = self.object_path(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let payload = self.decode(key, &data)?;
        debug!(key = %key, path = %path.display(), size = data.len(), "Read page from disk");
        Ok(Some(Bytes::from(payload)))
    }

    async fn put(&self, key: BlockKey, payload: Bytes) -> Result<(), StorageError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let encoded = self.encode(key, &payload)?;
        let tmp = path.with_extension(format!("kvpage.tmp.{}", Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&tmp, &encoded).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            warn!(key = %key, error = %e, "Rename of page file failed");
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key = %key, path = %path.display(), size = encoded.len(), "Wrote page to disk");
        Ok(())
    }

    async fn exists(&self, key: BlockKey) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.object_path(key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read_page() {
        let tmp = TempDir::new().unwrap();
        let backend = FileBackend::new(tmp.path().join("pages"), CompressionConfig::default())
            .await
            .unwrap();

        let key = BlockKey(0xabcd_0000_0000_0001);
        let data = Bytes::from(vec![42u8; 4096]);
        backend.put(key, data.clone()).await.unwrap();

        let path = backend.object_path(key);
        assert!(path.exists());
        assert!(path.starts_with(tmp.path().join("pages").join("ab")));
        // Compressed on disk.
        assert!(std::fs::metadata(&path).unwrap().len() < 4096);

        let read = backend.get(key).await.unwrap().unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_missing_page_is_none() {
        let tmp = TempDir::new().unwrap();
        let backend = FileBackend::new(tmp.path(), CompressionConfig::default())
            .await
            .unwrap();
        assert!(backend.get(BlockKey(5)).await.unwrap().is_none());
        assert!(!backend.exists(BlockKey(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temporaries() {
        let tmp = TempDir::new().unwrap();
        let backend = FileBackend::new(tmp.path(), CompressionConfig::default())
            .await
            .unwrap();
        let key = BlockKey(0x1100);
        backend.put(key, Bytes::from_static(b"first")).await.unwrap();
        backend.put(key, Bytes::from_static(b"second")).await.unwrap();

        assert_eq!(backend.get(key).await.unwrap().unwrap(), "second");
        let shard = backend.object_path(key).parent().unwrap().to_path_buf();
        let entries = std::fs::read_dir(shard).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_corrupt_page_rejected() {
        let tmp = TempDir::new().unwrap();
        let backend = FileBackend::new(tmp.path(), CompressionConfig::default())
            .await
            .unwrap();
        let key = BlockKey(0x2200);
        backend.put(key, Bytes::from_static(b"payload")).await.unwrap();

        std::fs::write(backend.object_path(key), b"garbage").unwrap();
        let err = backend.get(key).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn test_header_is_packed() {
        assert_eq!(HEADER_LEN, 24);
    }
}
