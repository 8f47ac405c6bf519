//! Session checkpoints on disk.
//!
//! A checkpoint is the JSON form of a [`SessionSnapshot`], stored as
//! `<dir>/<session id>.json`. Writes go to a temporary file first and are
//! renamed into place, so a crash never leaves a truncated checkpoint.

use std::io;
use std::path::{Path, PathBuf};

use bucketlift_protocol::SessionSnapshot;

use crate::TransferError;

/// Returns the checkpoint path for `session_id` inside `dir`.
///
/// Store-issued ids are opaque, so anything outside `[A-Za-z0-9._-]` is
/// replaced to keep the name a single path component.
pub fn checkpoint_path(dir: &Path, session_id: &str) -> PathBuf {
    let name: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{}.json", name.trim_start_matches('.')))
}

/// Writes `snapshot` into `dir` and returns the checkpoint path.
pub async fn save_snapshot(dir: &Path, snapshot: &SessionSnapshot) -> Result<PathBuf, TransferError> {
    tokio::fs::create_dir_all(dir).await?;

    let path = checkpoint_path(dir, &snapshot.session_id);
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_vec_pretty(snapshot)?;
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(path)
}

/// Reads a checkpoint file.
pub async fn load_snapshot(path: &Path) -> Result<SessionSnapshot, TransferError> {
    let content = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}

/// Deletes the checkpoint for `session_id`, if any.
pub async fn remove_snapshot(dir: &Path, session_id: &str) -> Result<(), TransferError> {
    match tokio::fs::remove_file(checkpoint_path(dir, session_id)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketlift_protocol::{PartRecord, TransferState};
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample(id: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_id: id.into(),
            destination_key: "clip.mp4".into(),
            total_size: 3,
            part_size: 5,
            state: TransferState::InProgress,
            parts: vec![PartRecord::pending(1, 0, 3)],
            created_at: Utc::now(),
            store_released: false,
            last_error: String::new(),
        }
    }

    #[test]
    fn path_sanitizes_session_id() {
        let dir = Path::new("/var/lib/bucketlift");
        assert_eq!(
            checkpoint_path(dir, "abc-123"),
            dir.join("abc-123.json")
        );
        assert_eq!(
            checkpoint_path(dir, "../x/y"),
            dir.join("_x_y.json")
        );
    }

    #[tokio::test]
    async fn save_load_remove() {
        let dir = TempDir::new().unwrap();
        let ckpt_dir = dir.path().join("checkpoints");
        let snap = sample("upload-7");

        let path = save_snapshot(&ckpt_dir, &snap).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = load_snapshot(&path).await.unwrap();
        assert_eq!(loaded, snap);

        remove_snapshot(&ckpt_dir, "upload-7").await.unwrap();
        assert!(!path.exists());
        // Removing again is fine.
        remove_snapshot(&ckpt_dir, "upload-7").await.unwrap();
    }

    #[tokio::test]
    async fn save_overwrites_previous() {
        let dir = TempDir::new().unwrap();
        let mut snap = sample("u1");
        save_snapshot(dir.path(), &snap).await.unwrap();

        snap.state = TransferState::Failed;
        let path = save_snapshot(dir.path(), &snap).await.unwrap();
        assert_eq!(load_snapshot(&path).await.unwrap().state, TransferState::Failed);
    }

    #[tokio::test]
    async fn load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            load_snapshot(&path).await,
            Err(TransferError::Snapshot(_))
        ));
    }
}
