use std::io;
use std::path::{Component, Path, PathBuf};

use bucketlift_protocol::{CompletedPart, Confirmation};
use bucketlift_transfer::{
    ObjectStore, StoreError, StoreFuture, checksum_bytes, validate_destination_key,
};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

/// Directory under the root where in-progress uploads are staged.
const STAGING_DIR: &str = ".multipart";

/// Object store backed by a local directory.
///
/// Each session stages its parts in `<root>/.multipart/<session id>/`.
/// Completion concatenates them in part order into `<root>/<key>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

fn io_error(context: &str, e: io::Error) -> StoreError {
    let msg = format!("{context}: {e}");
    match e.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            StoreError::Transient(msg)
        }
        _ => StoreError::Permanent(msg),
    }
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps `key` onto a file below the root.
    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_destination_key(key).map_err(|e| StoreError::Permanent(e.to_string()))?;

        let path = Path::new(key);
        if path.file_name().is_none() {
            return Err(StoreError::Permanent(format!("key has no file name: {key}")));
        }
        let first = path.components().find(|c| !matches!(c, Component::CurDir));
        if first == Some(Component::Normal(STAGING_DIR.as_ref())) {
            return Err(StoreError::Permanent(format!("key uses reserved prefix: {key}")));
        }
        Ok(self.root.join(path))
    }

    /// Staging directory of an existing session.
    async fn staging_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let id = Uuid::parse_str(session_id)
            .map_err(|_| StoreError::Permanent(format!("no such upload: {session_id}")))?;
        let dir = self.root.join(STAGING_DIR).join(id.to_string());
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(StoreError::Permanent(format!("no such upload: {session_id}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::Permanent(format!("no such upload: {session_id}")))
            }
            Err(e) => Err(io_error("reading staging directory", e)),
        }
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("part-{part_number:05}"))
    }
}

impl ObjectStore for LocalObjectStore {
    fn initiate<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String> {
        Box::pin(async move {
            self.object_path(key)?;

            let id = Uuid::new_v4().to_string();
            let dir = self.root.join(STAGING_DIR).join(&id);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error("creating staging directory", e))?;

            debug!(session = %id, key, dir = %dir.display(), "local upload staged");
            Ok(id)
        })
    }

    fn upload_part<'a>(
        &'a self,
        session_id: &'a str,
        key: &'a str,
        part_number: u32,
        body: Bytes,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            self.object_path(key)?;
            if part_number == 0 {
                return Err(StoreError::Permanent("part numbers start at 1".into()));
            }
            let dir = self.staging_dir(session_id).await?;

            // Write then rename so a retried part never leaves a torn file.
            let path = Self::part_path(&dir, part_number);
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &body)
                .await
                .map_err(|e| io_error("writing part", e))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| io_error("storing part", e))?;

            Ok(checksum_bytes(&body))
        })
    }

    fn complete<'a>(
        &'a self,
        session_id: &'a str,
        key: &'a str,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, Confirmation> {
        Box::pin(async move {
            let target = self.object_path(key)?;
            let dir = self.staging_dir(session_id).await?;

            if parts.is_empty() {
                return Err(StoreError::Permanent("no parts to assemble".into()));
            }
            if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
                return Err(StoreError::Permanent("parts must be in ascending order".into()));
            }

            let assembled = dir.join("assembled");
            let mut out = tokio::fs::File::create(&assembled)
                .await
                .map_err(|e| io_error("creating object", e))?;
            let mut size = 0u64;
            for part in parts {
                let data = tokio::fs::read(Self::part_path(&dir, part.part_number))
                    .await
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::NotFound => {
                            StoreError::Permanent(format!("part {} was never uploaded", part.part_number))
                        }
                        _ => io_error("reading part", e),
                    })?;
                if checksum_bytes(&data) != part.etag {
                    return Err(StoreError::Permanent(format!(
                        "etag mismatch for part {}",
                        part.part_number
                    )));
                }
                out.write_all(&data)
                    .await
                    .map_err(|e| io_error("writing object", e))?;
                size += data.len() as u64;
            }
            out.flush().await.map_err(|e| io_error("writing object", e))?;
            drop(out);

            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("creating object directory", e))?;
            }
            tokio::fs::rename(&assembled, &target)
                .await
                .map_err(|e| io_error("publishing object", e))?;
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| io_error("removing staging directory", e))?;

            let joined: String = parts.iter().map(|p| p.etag.as_str()).collect();
            let etag = format!("{}-{}", checksum_bytes(joined.as_bytes()), parts.len());
            info!(session = session_id, key, bytes = size, parts = parts.len(), "local object assembled");

            Ok(Confirmation {
                destination_key: key.to_string(),
                etag: Some(etag),
                location: Some(target.display().to_string()),
            })
        })
    }

    fn abort<'a>(&'a self, session_id: &'a str, _key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dir = match self.staging_dir(session_id).await {
                Ok(dir) => dir,
                // Unknown or already removed.
                Err(StoreError::Permanent(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error("removing staging directory", e)),
            }
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn completed(n: u32, etag: String) -> CompletedPart {
        CompletedPart {
            part_number: n,
            etag,
        }
    }

    #[tokio::test]
    async fn assembles_parts_in_order() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());

        let id = store.initiate("media/clip.bin").await.unwrap();
        // Upload out of order.
        let e2 = store
            .upload_part(&id, "media/clip.bin", 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let e1 = store
            .upload_part(&id, "media/clip.bin", 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        assert_eq!(e1, checksum_bytes(b"hello "));

        let confirmation = store
            .complete(&id, "media/clip.bin", &[completed(1, e1), completed(2, e2)])
            .await
            .unwrap();
        assert_eq!(confirmation.destination_key, "media/clip.bin");
        assert!(confirmation.etag.unwrap().ends_with("-2"));

        let object = std::fs::read(dir.path().join("media/clip.bin")).unwrap();
        assert_eq!(object, b"hello world");
        assert!(!dir.path().join(STAGING_DIR).join(&id).exists());
    }

    #[tokio::test]
    async fn retried_part_replaces_previous_bytes() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let id = store.initiate("a.bin").await.unwrap();

        store.upload_part(&id, "a.bin", 1, Bytes::from_static(b"old")).await.unwrap();
        let etag = store.upload_part(&id, "a.bin", 1, Bytes::from_static(b"new")).await.unwrap();
        store.complete(&id, "a.bin", &[completed(1, etag)]).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.bin")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn complete_rejects_bad_manifests() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let id = store.initiate("a.bin").await.unwrap();
        let e1 = store.upload_part(&id, "a.bin", 1, Bytes::from_static(b"x")).await.unwrap();

        let err = store.complete(&id, "a.bin", &[]).await.unwrap_err();
        assert!(!err.is_transient());

        let err = store
            .complete(&id, "a.bin", &[completed(1, "bogus".into())])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("etag mismatch"));

        let err = store
            .complete(&id, "a.bin", &[completed(1, e1.clone()), completed(2, e1.clone())])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("never uploaded"));

        let err = store
            .complete(&id, "a.bin", &[completed(1, e1.clone()), completed(1, e1)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ascending"));

        assert!(!dir.path().join("a.bin").exists());
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let id = store.initiate("a.bin").await.unwrap();
        store.upload_part(&id, "a.bin", 1, Bytes::from_static(b"x")).await.unwrap();

        store.abort(&id, "a.bin").await.unwrap();
        store.abort(&id, "a.bin").await.unwrap();
        assert!(!dir.path().join(STAGING_DIR).join(&id).exists());

        let err = store
            .upload_part(&id, "a.bin", 2, Bytes::from_static(b"y"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no such upload"));
    }

    #[tokio::test]
    async fn unsafe_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in ["../escape.bin", "/etc/passwd", "", ".multipart/x", "./.multipart/x", "."] {
            assert!(store.initiate(key).await.is_err(), "key {key:?} accepted");
        }
    }

    #[tokio::test]
    async fn session_ids_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store
            .upload_part("../../tmp", "a.bin", 1, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        store.abort("../../tmp", "a.bin").await.unwrap();
    }
}
