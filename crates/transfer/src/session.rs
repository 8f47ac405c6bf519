use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bucketlift_protocol::{
    CompletedPart, PartRecord, PartStatus, ProgressReport, SessionSnapshot, TransferState,
};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::TransferError;
use crate::progress::ProgressSink;

/// Client-side bookkeeping for one multipart upload (thread-safe).
///
/// Every mutation of parts, byte counts and state goes through the methods
/// here, each under a single write lock.
pub struct TransferSession {
    inner: RwLock<SessionInner>,
    /// Byte count of the last report handed to a sink.
    delivered: Mutex<Option<u64>>,
}

struct SessionInner {
    id: String,
    destination_key: String,
    total_size: u64,
    part_size: u64,
    parts: Vec<PartRecord>,
    uploaded_bytes: u64,
    state: TransferState,
    created_at: DateTime<Utc>,
    store_released: bool,
    last_error: String,
    abort_error: String,
}

impl SessionInner {
    fn ensure_active(&self) -> Result<(), TransferError> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(TransferError::SessionTerminal {
                session_id: self.id.clone(),
                state: self.state,
            })
        }
    }

    fn part_mut(&mut self, part_number: u32) -> Result<&mut PartRecord, TransferError> {
        let index = part_number
            .checked_sub(1)
            .map(|i| i as usize)
            .filter(|&i| i < self.parts.len())
            .ok_or(TransferError::UnknownPart(part_number))?;
        Ok(&mut self.parts[index])
    }
}

impl TransferSession {
    /// Creates a freshly initiated session from a part plan.
    pub fn new(
        id: String,
        destination_key: String,
        total_size: u64,
        part_size: u64,
        parts: Vec<PartRecord>,
    ) -> Self {
        Self {
            inner: RwLock::new(SessionInner {
                id,
                destination_key,
                total_size,
                part_size,
                parts,
                uploaded_bytes: 0,
                state: TransferState::Initiated,
                created_at: Utc::now(),
                store_released: false,
                last_error: String::new(),
                abort_error: String::new(),
            }),
            delivered: Mutex::new(None),
        }
    }

    /// Rebuilds an in-progress session from a checkpoint.
    ///
    /// Failed parts go back to pending and the byte count is recomputed from
    /// the uploaded parts.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut parts = snapshot.parts;
        for part in parts.iter_mut().filter(|p| p.status == PartStatus::Failed) {
            part.status = PartStatus::Pending;
        }
        let uploaded_bytes = parts
            .iter()
            .filter(|p| p.is_uploaded())
            .map(PartRecord::len)
            .sum();
        Self {
            inner: RwLock::new(SessionInner {
                id: snapshot.session_id,
                destination_key: snapshot.destination_key,
                total_size: snapshot.total_size,
                part_size: snapshot.part_size,
                parts,
                uploaded_bytes,
                state: TransferState::InProgress,
                created_at: snapshot.created_at,
                store_released: snapshot.store_released,
                last_error: String::new(),
                abort_error: String::new(),
            }),
            delivered: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves an initiated session to `InProgress`.
    pub fn start(&self) {
        let mut s = self.write();
        if s.state == TransferState::Initiated {
            s.state = TransferState::InProgress;
        }
    }

    /// Fails with `SessionTerminal` unless parts may still be uploaded.
    pub fn ensure_active(&self) -> Result<(), TransferError> {
        self.read().ensure_active()
    }

    /// Returns a copy of one part record.
    pub fn part(&self, part_number: u32) -> Result<PartRecord, TransferError> {
        let mut s = self.write();
        s.part_mut(part_number).map(|p| p.clone())
    }

    /// Records a successful part upload and returns the updated record.
    ///
    /// Rejected once the session is terminal, which is how late results
    /// arriving after an abort get discarded. Re-recording an uploaded part
    /// refreshes its etag without counting its bytes twice.
    pub fn record_uploaded(
        &self,
        part_number: u32,
        etag: String,
        checksum: String,
    ) -> Result<PartRecord, TransferError> {
        let mut s = self.write();
        s.ensure_active()?;
        let part = s.part_mut(part_number)?;
        let newly_uploaded = !part.is_uploaded();
        part.etag = Some(etag);
        part.checksum = Some(checksum);
        part.status = PartStatus::Uploaded;
        let record = part.clone();
        if newly_uploaded {
            s.uploaded_bytes += record.len();
        }
        Ok(record)
    }

    /// Marks a part as failed, which fails the whole session.
    pub fn mark_part_failed(&self, part_number: u32, error: &str) {
        let mut s = self.write();
        if !s.state.is_active() {
            return;
        }
        if let Ok(part) = s.part_mut(part_number) {
            part.status = PartStatus::Failed;
        }
        s.state = TransferState::Failed;
        s.last_error = error.to_string();
    }

    /// Puts an uploaded part back to pending, e.g. when the source changed
    /// since the part was sent.
    pub fn reset_part(&self, part_number: u32) -> Result<(), TransferError> {
        let mut s = self.write();
        let part = s.part_mut(part_number)?;
        let was_uploaded = part.is_uploaded();
        part.status = PartStatus::Pending;
        part.etag = None;
        part.checksum = None;
        let len = part.len();
        if was_uploaded {
            s.uploaded_bytes -= len;
        }
        Ok(())
    }

    /// Marks the session as failed with an error message.
    ///
    /// No effect on a session that is already terminal, so the first
    /// failure reason is the one kept.
    pub fn fail(&self, error: &str) {
        let mut s = self.write();
        if s.state.is_terminal() {
            return;
        }
        s.state = TransferState::Failed;
        s.last_error = error.to_string();
    }

    /// Marks the session as completed.
    pub fn complete(&self) -> Result<(), TransferError> {
        let mut s = self.write();
        s.ensure_active()?;
        s.state = TransferState::Completed;
        Ok(())
    }

    /// Claims the store-side release for the caller.
    ///
    /// Returns `false` when there is nothing to release: the session is
    /// completed, or a previous call already claimed it. An active session
    /// becomes `Aborted`; a failed one stays `Failed` so its reason survives.
    pub fn claim_release(&self) -> bool {
        let mut s = self.write();
        if s.store_released || s.state == TransferState::Completed {
            return false;
        }
        s.store_released = true;
        if s.state != TransferState::Failed {
            s.state = TransferState::Aborted;
        }
        true
    }

    /// Records why releasing the store-side upload failed.
    pub fn record_abort_error(&self, error: &str) {
        self.write().abort_error = error.to_string();
    }

    /// Returns the ordered `(part number, etag)` pairs for completion.
    ///
    /// Fails without touching the store if the session is not active or any
    /// part is not uploaded yet.
    pub fn completed_parts(&self) -> Result<Vec<CompletedPart>, TransferError> {
        let s = self.read();
        s.ensure_active()?;

        let missing: Vec<u32> = s
            .parts
            .iter()
            .filter(|p| !p.is_uploaded() || p.etag.is_none())
            .map(|p| p.part_number)
            .collect();
        if !missing.is_empty() {
            return Err(TransferError::IncompleteParts { missing });
        }

        Ok(s.parts
            .iter()
            .filter_map(|p| {
                p.etag.clone().map(|etag| CompletedPart {
                    part_number: p.part_number,
                    etag,
                })
            })
            .collect())
    }

    /// Part numbers not yet uploaded, ascending.
    pub fn pending_parts(&self) -> Vec<u32> {
        let s = self.read();
        s.parts
            .iter()
            .filter(|p| !p.is_uploaded())
            .map(|p| p.part_number)
            .collect()
    }

    /// Invokes `sink` with the current byte counts.
    ///
    /// The session lock is released before the sink runs, so a slow sink
    /// never holds up part bookkeeping and a sink may call back into the
    /// session. Reports are serialized among themselves; one that lost a
    /// race to a newer count is dropped, so a sink sees non-decreasing byte
    /// counts. A panicking sink is logged and otherwise ignored.
    pub fn report_progress(&self, sink: &dyn ProgressSink) {
        let (id, uploaded, total) = {
            let s = self.read();
            (s.id.clone(), s.uploaded_bytes, s.total_size)
        };

        let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        if delivered.is_some_and(|last| uploaded < last) {
            return;
        }
        *delivered = Some(uploaded);

        let result = catch_unwind(AssertUnwindSafe(|| {
            sink.on_progress(&id, uploaded, total);
        }));
        if result.is_err() {
            warn!(session = %id, "progress sink panicked");
        }
    }

    /// Returns current progress as a serializable report.
    pub fn progress(&self) -> ProgressReport {
        let s = self.read();
        ProgressReport {
            session_id: s.id.clone(),
            destination_key: s.destination_key.clone(),
            state: s.state,
            total_bytes: s.total_size,
            uploaded_bytes: s.uploaded_bytes,
            parts_total: s.parts.len() as u32,
            parts_uploaded: s.parts.iter().filter(|p| p.is_uploaded()).count() as u32,
            error: s.last_error.clone(),
        }
    }

    /// Returns a checkpoint of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let s = self.read();
        SessionSnapshot {
            session_id: s.id.clone(),
            destination_key: s.destination_key.clone(),
            total_size: s.total_size,
            part_size: s.part_size,
            state: s.state,
            parts: s.parts.clone(),
            created_at: s.created_at,
            store_released: s.store_released,
            last_error: s.last_error.clone(),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> String {
        self.read().id.clone()
    }

    pub fn destination_key(&self) -> String {
        self.read().destination_key.clone()
    }

    /// Returns the current state.
    pub fn state(&self) -> TransferState {
        self.read().state
    }

    /// Returns `true` if parts may still be uploaded.
    pub fn is_active(&self) -> bool {
        self.read().state.is_active()
    }

    pub fn total_size(&self) -> u64 {
        self.read().total_size
    }

    pub fn part_size(&self) -> u64 {
        self.read().part_size
    }

    /// Returns bytes uploaded so far.
    pub fn uploaded_bytes(&self) -> u64 {
        self.read().uploaded_bytes
    }

    /// Returns a copy of all part records.
    pub fn parts(&self) -> Vec<PartRecord> {
        self.read().parts.clone()
    }

    pub fn store_released(&self) -> bool {
        self.read().store_released
    }

    /// Most recent failure reason (empty if none).
    pub fn last_error(&self) -> String {
        self.read().last_error.clone()
    }

    /// Failure of the store-side release (empty if none).
    pub fn abort_error(&self) -> String {
        self.read().abort_error.clone()
    }
}
