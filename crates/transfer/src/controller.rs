//! Multipart transfer controller.
//!
//! Drives the three-phase upload protocol (initiate, upload parts, complete)
//! against an [`ObjectStore`], with bounded part parallelism, per-attempt
//! timeouts, retry with backoff, prompt cancellation and optional
//! checkpoints for resuming after a crash.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bucketlift_protocol::{Confirmation, PartRecord, SessionSnapshot, TransferState};
use chrono::{TimeDelta, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{remove_snapshot, save_snapshot};
use crate::error::{StoreError, TransferError, TransferFailure};
use crate::plan::{fit_part_size, plan_parts};
use crate::progress::ProgressSink;
use crate::retry::RetryPolicy;
use crate::session::TransferSession;
use crate::source::{ByteSource, checksum_bytes};
use crate::store::ObjectStore;
use crate::validation::validate_destination_key;
use crate::{DEFAULT_PART_SIZE, MAX_PART_SIZE};

/// Tunables for a [`TransferController`].
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Requested part size; grown automatically for very large sources.
    pub part_size: u64,
    /// Upper bound on part uploads in flight for one session.
    pub max_concurrent_parts: usize,
    /// Timeout for a single part-upload attempt.
    pub part_timeout: Duration,
    pub retry: RetryPolicy,
    /// Where session checkpoints are written; `None` disables them.
    pub checkpoint_dir: Option<PathBuf>,
    /// How long the store keeps an abandoned multipart upload.
    pub session_retention: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            max_concurrent_parts: 4,
            part_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            checkpoint_dir: None,
            session_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// A started transfer: the session plus what it reads from and reports to.
///
/// Cheap to clone; clones share the same session and cancellation token.
#[derive(Clone)]
pub struct TransferHandle {
    session: Arc<TransferSession>,
    source: Arc<dyn ByteSource>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    checkpoint_lock: Arc<Mutex<()>>,
}

impl TransferHandle {
    fn new(
        session: TransferSession,
        source: Arc<dyn ByteSource>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            session: Arc::new(session),
            source,
            sink,
            cancel: CancellationToken::new(),
            checkpoint_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    pub fn session_id(&self) -> String {
        self.session.id()
    }

    pub fn state(&self) -> TransferState {
        self.session.state()
    }

    /// Token cancelled when the transfer is aborted.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Runs multipart transfers against one object store.
#[derive(Clone)]
pub struct TransferController {
    store: Arc<dyn ObjectStore>,
    config: TransferConfig,
}

impl TransferController {
    /// Creates a controller, rejecting configurations that cannot work.
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Result<Self, TransferError> {
        if config.part_size == 0 || config.part_size > MAX_PART_SIZE {
            return Err(TransferError::InvalidPartSize(format!(
                "{} not in 1..={MAX_PART_SIZE}",
                config.part_size
            )));
        }
        if config.max_concurrent_parts == 0 {
            return Err(TransferError::InvalidConfig(
                "max_concurrent_parts must be at least 1".into(),
            ));
        }
        if config.retry.max_attempts == 0 {
            return Err(TransferError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if config.part_timeout.is_zero() {
            return Err(TransferError::InvalidConfig(
                "part_timeout must be greater than zero".into(),
            ));
        }
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Opens a multipart upload for `source` and plans its parts.
    ///
    /// Store rejection is fatal and not retried.
    pub async fn start(
        &self,
        source: Arc<dyn ByteSource>,
        destination_key: &str,
        total_size: u64,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TransferHandle, TransferError> {
        validate_destination_key(destination_key)?;

        let actual = source.len();
        if actual != total_size {
            return Err(TransferError::SourceSizeMismatch {
                expected: total_size,
                actual,
            });
        }

        let part_size = fit_part_size(total_size, self.config.part_size);
        if part_size > MAX_PART_SIZE {
            return Err(TransferError::InvalidPartSize(format!(
                "{total_size} bytes need parts of {part_size}, above {MAX_PART_SIZE}"
            )));
        }
        let parts = plan_parts(total_size, part_size)?;

        let session_id = self
            .store
            .initiate(destination_key)
            .await
            .map_err(TransferError::Initiation)?;

        info!(
            store = self.store.name(),
            session = %session_id,
            key = destination_key,
            total_bytes = total_size,
            parts = parts.len(),
            part_size,
            "multipart upload initiated"
        );

        let session = TransferSession::new(
            session_id,
            destination_key.to_string(),
            total_size,
            part_size,
            parts,
        );
        session.start();

        let handle = TransferHandle::new(session, source, sink);
        self.checkpoint(&handle).await;
        Ok(handle)
    }

    /// Rebuilds a transfer from a checkpoint so the remaining parts can be
    /// uploaded.
    ///
    /// Parts recorded as uploaded are re-read and compared against their
    /// checksums; a part whose bytes changed goes back to pending.
    pub async fn resume(
        &self,
        snapshot: SessionSnapshot,
        source: Arc<dyn ByteSource>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TransferHandle, TransferError> {
        if !snapshot.is_resumable() {
            return Err(TransferError::SessionTerminal {
                session_id: snapshot.session_id,
                state: snapshot.state,
            });
        }

        let retention = TimeDelta::from_std(self.config.session_retention)
            .unwrap_or(TimeDelta::MAX);
        if snapshot.is_expired(Utc::now(), retention) {
            return Err(TransferError::SessionExpired(snapshot.session_id));
        }

        let actual = source.len();
        if actual != snapshot.total_size {
            return Err(TransferError::SourceSizeMismatch {
                expected: snapshot.total_size,
                actual,
            });
        }

        let session = TransferSession::from_snapshot(snapshot);
        for part in session.parts().into_iter().filter(PartRecord::is_uploaded) {
            let body = source.read_range(part.start, part.len()).await?;
            if part.checksum.as_deref() != Some(checksum_bytes(&body).as_str()) {
                warn!(
                    session = %session.id(),
                    part = part.part_number,
                    "source changed since part was uploaded, re-sending"
                );
                session.reset_part(part.part_number)?;
            }
        }

        info!(
            store = self.store.name(),
            session = %session.id(),
            uploaded_bytes = session.uploaded_bytes(),
            pending = session.pending_parts().len(),
            "multipart upload resumed"
        );

        let handle = TransferHandle::new(session, source, sink);
        self.checkpoint(&handle).await;
        Ok(handle)
    }

    /// Uploads one part, retrying transient failures with backoff.
    ///
    /// An already uploaded part is returned as is. Exhausted retries or a
    /// permanent store error mark the part and the session `Failed`.
    pub async fn upload_part(
        &self,
        handle: &TransferHandle,
        part_number: u32,
    ) -> Result<PartRecord, TransferError> {
        self.upload_part_with(handle, part_number, &handle.cancel)
            .await
    }

    async fn upload_part_with(
        &self,
        handle: &TransferHandle,
        part_number: u32,
        cancel: &CancellationToken,
    ) -> Result<PartRecord, TransferError> {
        let session = handle.session();
        session.ensure_active()?;
        let part = session.part(part_number)?;
        if part.is_uploaded() {
            return Ok(part);
        }

        let session_id = session.id();
        let key = session.destination_key();

        let body = match handle.source.read_range(part.start, part.len()).await {
            Ok(body) => body,
            Err(e) => {
                session.fail(&format!("reading part {part_number}: {e}"));
                self.checkpoint(handle).await;
                return Err(e.into());
            }
        };
        let checksum = checksum_bytes(&body);

        let timeout = self.config.part_timeout;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                r = tokio::time::timeout(
                    timeout,
                    self.store.upload_part(&session_id, &key, part_number, body.clone()),
                ) => match r {
                    Ok(r) => r,
                    Err(_) => Err(StoreError::Transient(format!(
                        "part upload timed out after {timeout:?}"
                    ))),
                },
            };

            match result {
                Ok(etag) => {
                    let record = match session.record_uploaded(part_number, etag, checksum) {
                        Ok(record) => record,
                        // Another part ended the session while this one was in flight.
                        Err(TransferError::SessionTerminal { state, .. }) => {
                            debug!(
                                session = %session_id,
                                part = part_number,
                                ?state,
                                "discarding late part result"
                            );
                            return Err(TransferError::Cancelled);
                        }
                        Err(e) => return Err(e),
                    };
                    debug!(
                        session = %session_id,
                        part = part_number,
                        bytes = record.len(),
                        attempt,
                        "part uploaded"
                    );
                    session.report_progress(handle.sink.as_ref());
                    self.checkpoint(handle).await;
                    return Ok(record);
                }
                Err(e) if e.is_transient() && self.config.retry.allows_retry(attempt) => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        session = %session_id,
                        part = part_number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "part upload failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    let failure = TransferError::PartUpload {
                        part_number,
                        attempts: attempt,
                        source: e,
                    };
                    error!(session = %session_id, error = %failure, "part upload failed");
                    session.mark_part_failed(part_number, &failure.to_string());
                    self.checkpoint(handle).await;
                    return Err(failure);
                }
            }
        }
    }

    /// Uploads every part not yet uploaded, at most
    /// `max_concurrent_parts` at a time.
    ///
    /// Parts are dispatched in ascending order. After the first failure no
    /// new parts are dispatched and those in flight are cancelled.
    pub async fn upload_all(&self, handle: &TransferHandle) -> Result<(), TransferError> {
        handle.session().ensure_active()?;

        let batch = handle.cancel.child_token();
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_parts));
        let mut tasks = JoinSet::new();

        for part_number in handle.session().pending_parts() {
            let permit = tokio::select! {
                biased;
                _ = batch.cancelled() => break,
                permit = Arc::clone(&limit).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            if batch.is_cancelled() {
                break;
            }

            let controller = self.clone();
            let handle = handle.clone();
            let batch = batch.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = controller
                    .upload_part_with(&handle, part_number, &batch)
                    .await;
                if result.is_err() {
                    batch.cancel();
                }
                result
            });
        }

        let mut first_error: Option<TransferError> = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e,
                Err(e) => {
                    batch.cancel();
                    handle.session().fail(&format!("part worker died: {e}"));
                    TransferError::Worker(format!("task join error: {e}"))
                }
            };
            // A real failure outranks the cancellations it caused.
            let replace = match &first_error {
                None => true,
                Some(prev) if is_knock_on(prev) => !is_knock_on(&err),
                Some(_) => false,
            };
            if replace {
                first_error = Some(err);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if handle.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Asks the store to assemble the object.
    ///
    /// Fails locally, without a store call, unless every part is uploaded.
    /// A store rejection fails the session, releases the store-side upload
    /// and is not retried.
    pub async fn complete(&self, handle: &TransferHandle) -> Result<Confirmation, TransferError> {
        let session = handle.session();
        let parts = session.completed_parts()?;
        let session_id = session.id();
        let key = session.destination_key();

        match self.store.complete(&session_id, &key, &parts).await {
            Ok(confirmation) => {
                session.complete()?;
                session.report_progress(handle.sink.as_ref());
                info!(
                    session = %session_id,
                    key = %key,
                    bytes = session.total_size(),
                    parts = parts.len(),
                    "multipart upload completed"
                );
                self.checkpoint(handle).await;
                self.release_source(handle).await;
                Ok(confirmation)
            }
            Err(e) => {
                error!(session = %session_id, error = %e, "completion rejected");
                session.fail(&format!("completion rejected: {e}"));
                self.release_store(handle).await;
                Err(TransferError::Completion(e))
            }
        }
    }

    /// Aborts the transfer and returns its final state.
    ///
    /// In-flight part uploads are cancelled and their results discarded.
    /// Idempotent: a completed or already aborted session is left alone.
    /// A failed session has its store-side upload released once and stays
    /// `Failed`. Store errors are logged, never returned.
    pub async fn abort(&self, handle: &TransferHandle) -> TransferState {
        match handle.state() {
            TransferState::Completed | TransferState::Aborted => {
                debug!(session = %handle.session_id(), "abort ignored, session already terminal");
            }
            _ => self.release_store(handle).await,
        }
        handle.state()
    }

    /// Invokes the progress sink with the current byte counts.
    pub fn report_progress(&self, handle: &TransferHandle) {
        handle.session().report_progress(handle.sink.as_ref());
    }

    /// Runs a whole transfer: start, upload every part, complete.
    ///
    /// On failure the store-side upload is aborted, except when retries ran
    /// out and checkpoints are enabled, in which case the session stays open
    /// for [`resume`](Self::resume).
    pub async fn run(
        &self,
        source: Arc<dyn ByteSource>,
        destination_key: &str,
        total_size: u64,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Confirmation, TransferFailure> {
        let handle = match self.start(source, destination_key, total_size, sink).await {
            Ok(handle) => handle,
            Err(error) => {
                error!(key = destination_key, error = %error, "transfer could not start");
                return Err(TransferFailure {
                    session_id: None,
                    destination_key: destination_key.to_string(),
                    state: TransferState::Failed,
                    error,
                    abort_error: None,
                    resumable: false,
                });
            }
        };
        self.finish(&handle).await
    }

    /// Uploads the remaining parts of `handle` and completes it, with the
    /// same failure handling as [`run`](Self::run).
    pub async fn finish(&self, handle: &TransferHandle) -> Result<Confirmation, TransferFailure> {
        if let Err(error) = self.upload_all(handle).await {
            let resumable = error.is_retry_exhaustion() && self.config.checkpoint_dir.is_some();
            if resumable {
                info!(
                    session = %handle.session_id(),
                    "retries exhausted, session kept open for resume"
                );
            } else {
                self.release_store(handle).await;
            }
            return Err(self.failure(handle, error, resumable));
        }

        self.complete(handle)
            .await
            .map_err(|error| self.failure(handle, error, false))
    }

    fn failure(&self, handle: &TransferHandle, error: TransferError, resumable: bool) -> TransferFailure {
        let session = handle.session();
        let abort_error = Some(session.abort_error()).filter(|e| !e.is_empty());
        TransferFailure {
            session_id: Some(session.id()),
            destination_key: session.destination_key(),
            state: session.state(),
            error,
            abort_error,
            resumable,
        }
    }

    /// Cancels in-flight work and aborts the store-side upload, once.
    async fn release_store(&self, handle: &TransferHandle) {
        handle.cancel.cancel();
        let session = handle.session();
        if !session.claim_release() {
            return;
        }

        let session_id = session.id();
        let key = session.destination_key();
        match self.store.abort(&session_id, &key).await {
            Ok(()) => {
                info!(session = %session_id, state = ?session.state(), "multipart upload aborted");
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "store abort failed");
                session.record_abort_error(&e.to_string());
            }
        }

        self.checkpoint(handle).await;
        if session.state() == TransferState::Aborted {
            self.release_source(handle).await;
        }
    }

    async fn release_source(&self, handle: &TransferHandle) {
        if let Err(e) = handle.source.release().await {
            warn!(session = %handle.session_id(), error = %e, "failed to release source");
        }
    }

    /// Writes or removes the session checkpoint, if checkpoints are enabled.
    ///
    /// Failures are logged; they cost the ability to resume, not the
    /// transfer itself.
    async fn checkpoint(&self, handle: &TransferHandle) {
        let Some(dir) = &self.config.checkpoint_dir else {
            return;
        };
        let _guard = handle.checkpoint_lock.lock().await;
        let snapshot = handle.session().snapshot();

        let result = if snapshot.is_resumable() {
            save_snapshot(dir, &snapshot).await.map(|_| ())
        } else {
            remove_snapshot(dir, &snapshot.session_id).await
        };
        if let Err(e) = result {
            warn!(session = %snapshot.session_id, error = %e, "checkpoint write failed");
        }
    }
}

/// Errors a part reports because some other part already ended the batch.
fn is_knock_on(err: &TransferError) -> bool {
    matches!(
        err,
        TransferError::Cancelled | TransferError::SessionTerminal { .. }
    )
}
