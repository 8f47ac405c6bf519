//! [`ObjectStore`](bucketlift_transfer::ObjectStore) implementations.
//!
//! [`S3ObjectStore`] talks to S3 or any S3-compatible service through the
//! AWS SDK. [`LocalObjectStore`] stages parts in a directory and is used
//! for development and tests.

mod local;
mod s3;

pub use local::LocalObjectStore;
pub use s3::{S3ObjectStore, status_is_transient};
