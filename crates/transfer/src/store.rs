//! Object store capability consumed by the controller.
//!
//! The uploader binary implements this trait on top of S3 or a local
//! directory. Keeping the store behind a trait keeps the controller
//! decoupled from any SDK and testable with mocks.

use std::future::Future;
use std::pin::Pin;

use bucketlift_protocol::{CompletedPart, Confirmation};
use bytes::Bytes;

use crate::error::StoreError;

/// Boxed future returned by [`ObjectStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Remote service exposing the multipart-upload protocol.
///
/// The destination key travels with the session id because S3-style stores
/// address an upload by bucket, key and upload id together.
pub trait ObjectStore: Send + Sync {
    /// Opens a multipart upload and returns its session id.
    fn initiate<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String>;

    /// Uploads one part and returns the store's etag for it.
    ///
    /// Safe to call concurrently for distinct part numbers of one session.
    fn upload_part<'a>(
        &'a self,
        session_id: &'a str,
        key: &'a str,
        part_number: u32,
        body: Bytes,
    ) -> StoreFuture<'a, String>;

    /// Assembles the object from `parts`, ordered by part number.
    fn complete<'a>(
        &'a self,
        session_id: &'a str,
        key: &'a str,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, Confirmation>;

    /// Releases server-side resources held by the session. Idempotent.
    fn abort<'a>(&'a self, session_id: &'a str, key: &'a str) -> StoreFuture<'a, ()>;

    /// Short name used in log fields.
    fn name(&self) -> &str;
}
