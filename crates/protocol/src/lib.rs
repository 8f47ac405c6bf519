//! Shared data types for bucketlift multipart transfers.
//!
//! Everything in here is plain serde data: the transfer core, the object
//! stores and the uploader binary all speak these types.

pub mod snapshot;
pub mod types;

pub use snapshot::SessionSnapshot;
pub use types::{
    CompletedPart, Confirmation, PartRecord, PartStatus, ProgressReport, TransferState,
};
