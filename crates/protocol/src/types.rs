use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "initiated")]
    Initiated,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "aborted")]
    Aborted,
    #[serde(rename = "failed")]
    Failed,
}

impl TransferState {
    /// Returns `true` for states that accept no further part uploads.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    /// Returns `true` for states in which parts may still be uploaded.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Initiated | Self::InProgress)
    }
}

/// Upload status of a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "uploaded")]
    Uploaded,
    #[serde(rename = "failed")]
    Failed,
}

/// One contiguous byte range of the source, uploaded independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    /// 1-based sequence number; the store assembles the object by this.
    pub part_number: u32,
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
    /// Confirmation token returned by the store for this part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// SHA-256 hex digest of the bytes sent for this part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub status: PartStatus,
}

impl PartRecord {
    /// Creates a pending part covering `[start, end)`.
    pub fn pending(part_number: u32, start: u64, end: u64) -> Self {
        Self {
            part_number,
            start,
            end,
            etag: None,
            checksum: None,
            status: PartStatus::Pending,
        }
    }

    /// Length of the part in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` for the zero-length part of an empty source.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn is_uploaded(&self) -> bool {
        self.status == PartStatus::Uploaded
    }
}

/// A `(part number, etag)` pair handed to the store on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// What the store returns once it has assembled the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub destination_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Point-in-time view of a session, suitable for relaying to a UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub session_id: String,
    pub destination_key: String,
    pub state: TransferState,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub parts_total: u32,
    pub parts_uploaded: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ProgressReport {
    /// Returns the upload progress as a percentage (0-100).
    ///
    /// An empty source counts as fully uploaded once its single part is.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.parts_total > 0 && self.parts_uploaded == self.parts_total {
                return 100.0;
            }
            return 0.0;
        }
        self.uploaded_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}
