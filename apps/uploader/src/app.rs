//! Command handlers: wire configuration, store and controller together.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use bucketlift_protocol::Confirmation;
use bucketlift_store::{LocalObjectStore, S3ObjectStore};
use bucketlift_transfer::checkpoint::{checkpoint_path, load_snapshot};
use bucketlift_transfer::{
    ByteSource, FileSource, ObjectStore, ProgressSink, SpeedCalculator, TransferController,
    TransferFailure, TransferHandle,
};
use tracing::{error, info, warn};

use crate::config::{Config, StoreKind};

/// Builds the object store selected by the configuration.
pub async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config.store {
        StoreKind::S3 => {
            if config.bucket.is_empty() {
                anyhow::bail!("no bucket configured for the s3 store");
            }
            let store = S3ObjectStore::connect(config.bucket.clone(), config.region.clone()).await;
            Ok(Arc::new(store))
        }
        StoreKind::Local => {
            std::fs::create_dir_all(&config.local_root).with_context(|| {
                format!("creating local store root {}", config.local_root.display())
            })?;
            info!(root = %config.local_root.display(), "using local store");
            Ok(Arc::new(LocalObjectStore::new(&config.local_root)))
        }
    }
}

/// Destination key for `file` when none is given: its file name.
pub fn default_key(file: &Path) -> anyhow::Result<String> {
    file.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("cannot derive a key from {}", file.display()))
}

async fn open_source(file: &Path, delete_source: bool) -> anyhow::Result<Arc<dyn ByteSource>> {
    let source = if delete_source {
        FileSource::temporary(file).await
    } else {
        FileSource::open(file).await
    }
    .with_context(|| format!("opening {}", file.display()))?;
    Ok(Arc::new(source))
}

/// Logs transfer progress with throughput and an ETA.
pub struct ProgressLogger {
    speed: SpeedCalculator,
}

impl ProgressLogger {
    pub fn new() -> Self {
        Self {
            speed: SpeedCalculator::default(),
        }
    }
}

impl Default for ProgressLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressLogger {
    fn on_progress(&self, session_id: &str, uploaded_bytes: u64, total_bytes: u64) {
        self.speed.observe(uploaded_bytes);

        let percent = if total_bytes == 0 {
            100.0
        } else {
            uploaded_bytes as f64 / total_bytes as f64 * 100.0
        };
        let eta_secs = self
            .speed
            .eta(total_bytes.saturating_sub(uploaded_bytes))
            .map(|eta| eta.as_secs());
        info!(
            session = session_id,
            uploaded_bytes,
            total_bytes,
            percent = %format_args!("{percent:.1}"),
            bytes_per_sec = self.speed.bytes_per_second() as u64,
            eta_secs = ?eta_secs,
            "progress"
        );
    }
}

/// `bucketlift upload`.
pub async fn upload(
    config: &Config,
    file: &Path,
    key: Option<String>,
    delete_source: bool,
) -> anyhow::Result<()> {
    let key = match key {
        Some(key) => key,
        None => default_key(file)?,
    };
    let store = build_store(config).await?;
    let ctl = TransferController::new(store, config.transfer_config())?;
    let source = open_source(file, delete_source).await?;
    let total_size = source.len();

    info!(file = %file.display(), key = %key, bytes = total_size, "starting upload");
    let handle = ctl
        .start(source, &key, total_size, Arc::new(ProgressLogger::new()))
        .await
        .with_context(|| format!("starting upload of {}", file.display()))?;

    drive(&ctl, &handle, config).await
}

/// `bucketlift resume`.
pub async fn resume(
    config: &Config,
    snapshot_path: &Path,
    file: &Path,
    delete_source: bool,
) -> anyhow::Result<()> {
    let snapshot = load_snapshot(snapshot_path)
        .await
        .with_context(|| format!("loading {}", snapshot_path.display()))?;
    let store = build_store(config).await?;
    let ctl = TransferController::new(store, config.transfer_config())?;
    let source = open_source(file, delete_source).await?;

    let handle = ctl
        .resume(snapshot, source, Arc::new(ProgressLogger::new()))
        .await
        .context("resuming upload")?;

    drive(&ctl, &handle, config).await
}

/// `bucketlift abort`: releases the store-side upload named by a checkpoint.
pub async fn abort(config: &Config, snapshot_path: &Path) -> anyhow::Result<()> {
    let snapshot = load_snapshot(snapshot_path)
        .await
        .with_context(|| format!("loading {}", snapshot_path.display()))?;
    let store = build_store(config).await?;

    if snapshot.store_released {
        info!(session = %snapshot.session_id, "upload already released");
    } else {
        store
            .abort(&snapshot.session_id, &snapshot.destination_key)
            .await
            .with_context(|| format!("aborting session {}", snapshot.session_id))?;
        info!(session = %snapshot.session_id, key = %snapshot.destination_key, "upload aborted");
    }

    tokio::fs::remove_file(snapshot_path)
        .await
        .with_context(|| format!("removing {}", snapshot_path.display()))?;
    Ok(())
}

/// Uploads the remaining parts and completes, aborting on Ctrl-C.
async fn drive(ctl: &TransferController, handle: &TransferHandle, config: &Config) -> anyhow::Result<()> {
    tokio::select! {
        result = ctl.finish(handle) => match result {
            Ok(confirmation) => {
                print_confirmation(&confirmation)?;
                Ok(())
            }
            Err(failure) => Err(report_failure(failure, config)),
        },
        _ = tokio::signal::ctrl_c() => {
            warn!(session = %handle.session_id(), "interrupted, aborting upload");
            let state = ctl.abort(handle).await;
            anyhow::bail!("upload interrupted, session {} is {state:?}", handle.session_id())
        }
    }
}

fn print_confirmation(confirmation: &Confirmation) -> anyhow::Result<()> {
    info!(
        key = %confirmation.destination_key,
        etag = ?confirmation.etag,
        location = ?confirmation.location,
        "upload complete"
    );
    println!("{}", serde_json::to_string_pretty(confirmation)?);
    Ok(())
}

fn report_failure(failure: TransferFailure, config: &Config) -> anyhow::Error {
    let checkpoint_dir = config.transfer_config().checkpoint_dir;
    error!(
        session = ?failure.session_id,
        key = %failure.destination_key,
        state = ?failure.state,
        resumable = failure.resumable,
        abort_error = ?failure.abort_error,
        error = %failure.error,
        "upload failed"
    );
    if let (true, Some(dir), Some(id)) = (
        failure.resumable,
        checkpoint_dir.as_deref(),
        failure.session_id.as_deref(),
    ) {
        eprintln!(
            "upload can be resumed: bucketlift resume {} <FILE>",
            checkpoint_path(dir, id).display()
        );
    }
    anyhow::Error::new(failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn local_config(root: &Path) -> Config {
        Config {
            store: StoreKind::Local,
            local_root: root.join("objects"),
            part_size: 4,
            checkpoint_dir: Some(root.join("sessions")),
            ..Config::default()
        }
    }

    #[test]
    fn key_defaults_to_file_name() {
        assert_eq!(default_key(Path::new("/tmp/in/clip.mp4")).unwrap(), "clip.mp4");
        assert!(default_key(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn s3_store_requires_bucket() {
        let config = Config::default();
        assert!(build_store(&config).await.is_err());
    }

    #[tokio::test]
    async fn upload_to_local_store() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("report.pdf");
        std::fs::write(&file, b"%PDF-1.7 minimal").unwrap();
        let config = local_config(tmp.path());

        upload(&config, &file, None, true).await.unwrap();

        let stored = std::fs::read(tmp.path().join("objects/report.pdf")).unwrap();
        assert_eq!(stored, b"%PDF-1.7 minimal");
        // Temporary source deleted after completion.
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn upload_with_explicit_key() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("in.bin");
        std::fs::write(&file, b"0123456789").unwrap();
        let config = local_config(tmp.path());

        upload(&config, &file, Some("archive/2026/out.bin".into()), false)
            .await
            .unwrap();

        assert!(tmp.path().join("objects/archive/2026/out.bin").exists());
        assert!(file.exists());
    }

    #[tokio::test]
    async fn abort_releases_checkpointed_session() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("in.bin");
        std::fs::write(&file, b"0123456789").unwrap();
        let config = local_config(tmp.path());

        let store = build_store(&config).await.unwrap();
        let ctl = TransferController::new(store, config.transfer_config()).unwrap();
        let source = open_source(&file, false).await.unwrap();
        let handle = ctl
            .start(source, "in.bin", 10, Arc::new(ProgressLogger::new()))
            .await
            .unwrap();
        ctl.upload_part(&handle, 1).await.unwrap();

        let dir: PathBuf = config.checkpoint_dir.clone().unwrap();
        let snapshot_path = checkpoint_path(&dir, &handle.session_id());
        abort(&config, &snapshot_path).await.unwrap();

        assert!(!snapshot_path.exists());
        let staging = config.local_root.join(".multipart").join(handle.session_id());
        assert!(!staging.exists());
    }
}
