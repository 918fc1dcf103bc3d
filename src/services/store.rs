//! Storage capability used by the upload state machine.
//!
//! A backend keeps two things per upload: the growing payload and a metadata
//! record. `write_at` is the only way the payload grows, and a backend must
//! keep the recorded offset equal to the number of durably written bytes
//! whenever it returns, including on error.

use crate::models::upload::{NewUpload, Upload};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream::BoxStream};
use std::{io, ops::Range};
use thiserror::Error;

/// Request or payload body as a stream of chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{id}` is at offset {actual}, write was for offset {expected}")]
    OffsetMismatch { id: String, expected: u64, actual: u64 },
    #[error("write exceeds the {limit} bytes accepted for upload `{id}`")]
    SizeExceeded { id: String, limit: u64 },
    #[error("stored record for upload `{id}` is invalid: {reason}")]
    Corrupt { id: String, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Short backend name used in logs and readiness output.
    fn name(&self) -> &'static str;

    /// Persist a new upload record at offset 0.
    async fn create(&self, new: NewUpload) -> StoreResult<Upload>;

    /// Append `body` at `offset`, accepting at most `limit` bytes.
    ///
    /// Fails with `OffsetMismatch` unless `offset` is the recorded offset.
    /// On any failure the payload is rolled back and the offset is untouched.
    /// Returns the new offset.
    async fn write_at(&self, id: &str, offset: u64, body: ByteStream, limit: u64)
    -> StoreResult<u64>;

    async fn read_meta(&self, id: &str) -> StoreResult<Upload>;

    /// Stream persisted bytes in `range`, clamped to the recorded offset.
    async fn read_content(&self, id: &str, range: Range<u64>) -> StoreResult<ByteStream>;

    /// Record the final length of a deferred-length upload.
    async fn declare_length(&self, id: &str, size: u64) -> StoreResult<Upload>;

    /// Fill `final_id` with the payloads of `partials`, in order.
    async fn concat(&self, final_id: &str, partials: &[String]) -> StoreResult<Upload>;

    /// Stamp the completion time.
    async fn finalize(&self, id: &str) -> StoreResult<Upload>;

    async fn delete(&self, id: &str) -> StoreResult<()>;

    async fn check_ready(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Drain `body` into memory, failing once more than `limit` bytes arrive.
pub(crate) async fn collect_limited(id: &str, mut body: ByteStream, limit: u64) -> StoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if buf.len() as u64 + chunk.len() as u64 > limit {
            return Err(StoreError::SizeExceeded {
                id: id.to_string(),
                limit,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Wrap any chunk stream as a `ByteStream`.
pub fn byte_stream<S>(stream: S) -> ByteStream
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    stream.boxed()
}
