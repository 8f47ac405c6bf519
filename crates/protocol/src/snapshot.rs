use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PartRecord, TransferState};

/// Persisted form of a transfer session, written as a checkpoint so an
/// interrupted upload can be resumed by a later process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub destination_key: String,
    pub total_size: u64,
    pub part_size: u64,
    pub state: TransferState,
    pub parts: Vec<PartRecord>,
    pub created_at: DateTime<Utc>,
    /// Set once the store-side upload has been aborted.
    #[serde(default)]
    pub store_released: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

impl SessionSnapshot {
    /// Sum of the lengths of all uploaded parts.
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.is_uploaded())
            .map(PartRecord::len)
            .sum()
    }

    /// Returns `true` if the store has likely discarded this upload.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: TimeDelta) -> bool {
        now - self.created_at > retention
    }

    /// Returns `true` if the store-side upload can still accept parts.
    pub fn is_resumable(&self) -> bool {
        !self.store_released
            && matches!(
                self.state,
                TransferState::Initiated | TransferState::InProgress | TransferState::Failed
            )
    }
}
