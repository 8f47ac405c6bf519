use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Boxed future returned by [`ByteSource`] methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Random-access byte source of known length.
///
/// Part uploads read their ranges independently and possibly concurrently,
/// so implementations must tolerate interleaved `read_range` calls.
pub trait ByteSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads exactly `len` bytes starting at `start`.
    fn read_range(&self, start: u64, len: u64) -> SourceFuture<'_, Bytes>;

    /// Cleans up once the transfer is `Completed` or `Aborted`.
    fn release(&self) -> SourceFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

fn out_of_range(start: u64, len: u64, total: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("range {start}+{len} beyond source length {total}"),
    )
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Reads part ranges from a file on disk.
pub struct FileSource {
    path: PathBuf,
    file: Mutex<File>,
    len: u64,
    delete_on_release: bool,
}

impl FileSource {
    /// Opens `path` for ranged reads. The file is left in place on release.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::open_inner(path.as_ref(), false).await
    }

    /// Opens a temporary ingress file that is deleted once the transfer
    /// reaches `Completed` or `Aborted`.
    pub async fn temporary(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::open_inner(path.as_ref(), true).await
    }

    async fn open_inner(path: &Path, delete_on_release: bool) -> io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            len,
            delete_on_release,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, start: u64, len: u64) -> SourceFuture<'_, Bytes> {
        Box::pin(async move {
            let end = start.checked_add(len).filter(|&end| end <= self.len);
            if end.is_none() {
                return Err(out_of_range(start, len, self.len));
            }
            let size = usize::try_from(len)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "range too large"))?;

            let mut buf = vec![0u8; size];
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(start)).await?;
            file.read_exact(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
    }

    fn release(&self) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            if !self.delete_on_release {
                return Ok(());
            }
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {
                    debug!(path = %self.path.display(), "removed temporary source");
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Serves part ranges from an in-memory buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, len: u64) -> SourceFuture<'_, Bytes> {
        let total = self.len();
        let range = start
            .checked_add(len)
            .filter(|&end| end <= total)
            .map(|end| start as usize..end as usize);
        let result = match range {
            Some(r) => Ok(self.data.slice(r)),
            None => Err(out_of_range(start, len, total)),
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
        assert_ne!(c1, checksum_bytes(b"hello"));
    }

    #[tokio::test]
    async fn file_source_reads_ranges() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "clip.bin", b"AABBCCDDEE");

        let source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.len(), 10);

        assert_eq!(&source.read_range(0, 4).await.unwrap()[..], b"AABB");
        assert_eq!(&source.read_range(8, 2).await.unwrap()[..], b"EE");
        // Out of order reads seek correctly.
        assert_eq!(&source.read_range(4, 4).await.unwrap()[..], b"CCDD");
        assert!(source.read_range(4, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_source_rejects_range_past_end() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "clip.bin", b"0123");

        let source = FileSource::open(&path).await.unwrap();
        let err = source.read_range(2, 5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn temporary_source_deleted_on_release() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "upload.tmp", b"data");

        let source = FileSource::temporary(&path).await.unwrap();
        source.release().await.unwrap();
        assert!(!path.exists());
        // Releasing twice is harmless.
        source.release().await.unwrap();
    }

    #[tokio::test]
    async fn opened_source_kept_on_release() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "keep.bin", b"data");

        let source = FileSource::open(&path).await.unwrap();
        source.release().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn memory_source_slices() {
        let source = MemorySource::new(b"0123456789".to_vec());
        assert_eq!(source.len(), 10);
        assert_eq!(&source.read_range(3, 4).await.unwrap()[..], b"3456");
        assert!(source.read_range(8, 3).await.is_err());
        assert!(MemorySource::default().is_empty());
    }
}
