use std::env;

use aws_config::BehaviorVersion;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_types::region::Region;
use bucketlift_protocol::{CompletedPart, Confirmation};
use bucketlift_transfer::{ObjectStore, StoreError, StoreFuture};
use bytes::Bytes;
use tracing::{debug, info};

/// Multipart uploads into one S3 bucket.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the standard AWS configuration chain.
    ///
    /// The region is `region` if given, then `AWS_REGION`, then the default
    /// provider chain, then `us-east-1`.
    pub async fn connect(bucket: impl Into<String>, region: Option<String>) -> Self {
        let region_provider = RegionProviderChain::first_try(
            region
                .or_else(|| env::var("AWS_REGION").ok())
                .map(Region::new),
        )
        .or_default_provider()
        .or_else(Region::new("us-east-1"));
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let store = Self::new(Client::new(&config), bucket);
        info!(bucket = %store.bucket, region = ?config.region(), "s3 store ready");
        store
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Returns `true` for HTTP statuses worth retrying: throttling and
/// server-side errors.
pub fn status_is_transient(status: u16) -> bool {
    status == 429 || status >= 500
}

fn classify<E>(err: SdkError<E>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => status_is_transient(service.raw().status().as_u16()),
        _ => false,
    };
    if transient {
        StoreError::Transient(message)
    } else {
        StoreError::Permanent(message)
    }
}

fn s3_part_number(part_number: u32) -> Result<i32, StoreError> {
    i32::try_from(part_number)
        .map_err(|_| StoreError::Permanent(format!("part number {part_number} out of range")))
}

impl ObjectStore for S3ObjectStore {
    fn initiate<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let output = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(classify)?;

            output
                .upload_id()
                .map(str::to_string)
                .ok_or_else(|| StoreError::Permanent("response carries no upload id".into()))
        })
    }

    fn upload_part<'a>(
        &'a self,
        session_id: &'a str,
        key: &'a str,
        part_number: u32,
        body: Bytes,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let len = body.len();
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(session_id)
                .part_number(s3_part_number(part_number)?)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(classify)?;

            debug!(upload_id = session_id, part = part_number, bytes = len, "s3 part stored");
            output
                .e_tag()
                .map(str::to_string)
                .ok_or_else(|| StoreError::Permanent(format!("part {part_number} has no etag")))
        })
    }

    fn complete<'a>(
        &'a self,
        session_id: &'a str,
        key: &'a str,
        parts: &'a [CompletedPart],
    ) -> StoreFuture<'a, Confirmation> {
        Box::pin(async move {
            let completed = parts
                .iter()
                .map(|p| {
                    Ok(S3CompletedPart::builder()
                        .part_number(s3_part_number(p.part_number)?)
                        .e_tag(&p.etag)
                        .build())
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            let upload = CompletedMultipartUpload::builder()
                .set_parts(Some(completed))
                .build();

            let output = self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(session_id)
                .multipart_upload(upload)
                .send()
                .await
                .map_err(classify)?;

            Ok(Confirmation {
                destination_key: key.to_string(),
                etag: output.e_tag().map(str::to_string),
                location: output.location().map(str::to_string),
            })
        })
    }

    fn abort<'a>(&'a self, session_id: &'a str, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let result = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(session_id)
                .send()
                .await;

            match result {
                Ok(_) => Ok(()),
                // Already gone (aborted, completed or expired).
                Err(SdkError::ServiceError(ref e)) if e.raw().status().as_u16() == 404 => {
                    debug!(upload_id = session_id, "s3 upload already released");
                    Ok(())
                }
                Err(e) => Err(classify(e)),
            }
        })
    }

    fn name(&self) -> &str {
        "s3"
    }
}
