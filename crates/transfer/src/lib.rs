//! Chunked, resumable multipart uploads with bounded parallelism.
//!
//! [`TransferController`] splits a [`ByteSource`] into parts, uploads them
//! to an [`ObjectStore`] with retries and per-part timeouts, reports
//! progress to a [`ProgressSink`] and asks the store to assemble the object
//! once every part is in.

pub mod checkpoint;
mod controller;
mod error;
mod plan;
mod progress;
mod retry;
mod session;
mod source;
mod store;
mod validation;

pub use controller::{TransferConfig, TransferController, TransferHandle};
pub use error::{StoreError, TransferError, TransferFailure};
pub use plan::{fit_part_size, plan_parts};
pub use progress::{
    ChannelSink, FnSink, NoopSink, ProgressSink, ProgressUpdate, SpeedCalculator,
};
pub use retry::RetryPolicy;
pub use session::TransferSession;
pub use source::{ByteSource, FileSource, MemorySource, SourceFuture, checksum_bytes};
pub use store::{ObjectStore, StoreFuture};
pub use validation::{MAX_KEY_LEN, validate_destination_key};

/// Smallest part S3-compatible stores accept, except for the last one.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Default part size: 8 MiB.
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Largest single part: 5 GiB.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Most parts one multipart upload may have.
pub const MAX_PARTS: usize = 10_000;
