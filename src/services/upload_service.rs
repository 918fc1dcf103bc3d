//! UploadService: the resumable upload state machine.
//!
//! Every mutation of an upload (PATCH, length declaration, termination) runs
//! under that upload's lease. Reads (HEAD, GET) skip the lease and rely on
//! the store only exposing committed bytes.
//!
//! Uploads move `Created → Uploading → Completed`, or start in `Deferred`
//! when the length is not known yet. `Completed` is terminal.
//!
//! Concatenation leases every partial while it copies them, and removes the
//! final upload again if the copy fails.

use crate::{
    models::upload::{MAX_UPLOAD_LENGTH, Metadata, NewUpload, Upload},
    services::{
        locker::{LockError, MemoryLocker},
        notifier::{CompletedUpload, CompletionNotifier},
        store::{ByteStream, DataStore, StoreError},
    },
};
use std::{collections::BTreeSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{id}` is at offset {actual}, request was for offset {expected}")]
    OffsetConflict { id: String, expected: u64, actual: u64 },
    #[error("length of upload `{0}` is already declared")]
    LengthAlreadyDeclared(String),
    #[error("upload `{0}` is already complete")]
    Gone(String),
    #[error("upload `{0}` is locked by another request")]
    Busy(String),
    #[error("upload `{0}` is a concatenation result and cannot be modified")]
    Forbidden(String),
    #[error("upload exceeds the maximum of {limit} bytes")]
    SizeExceeded { limit: u64 },
    #[error("invalid upload length: {0}")]
    InvalidLength(String),
    #[error("invalid concatenation: {0}")]
    InvalidConcat(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => UploadError::NotFound(id),
            StoreError::OffsetMismatch {
                id,
                expected,
                actual,
            } => UploadError::OffsetConflict {
                id,
                expected,
                actual,
            },
            StoreError::SizeExceeded { limit, .. } => UploadError::SizeExceeded { limit },
            other => UploadError::Store(other),
        }
    }
}

impl From<LockError> for UploadError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy(id) => UploadError::Busy(id),
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Clone)]
pub struct UploadService {
    store: Arc<dyn DataStore>,
    locker: MemoryLocker,
    notifier: CompletionNotifier,
    max_size: Option<u64>,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn DataStore>,
        locker: MemoryLocker,
        notifier: CompletionNotifier,
        max_size: Option<u64>,
    ) -> Self {
        Self {
            store,
            locker,
            notifier,
            max_size,
        }
    }

    pub fn store(&self) -> &dyn DataStore {
        self.store.as_ref()
    }

    pub fn locker(&self) -> &MemoryLocker {
        &self.locker
    }

    pub fn notifier(&self) -> &CompletionNotifier {
        &self.notifier
    }

    pub fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    /// Configured maximum, capped at what the backends can record.
    fn size_limit(&self) -> u64 {
        self.max_size
            .map_or(MAX_UPLOAD_LENGTH, |max| max.min(MAX_UPLOAD_LENGTH))
    }

    fn ensure_within_max(&self, size: u64) -> UploadResult<()> {
        let limit = self.size_limit();
        if size > limit {
            return Err(UploadError::SizeExceeded { limit });
        }
        Ok(())
    }

    /// Stamp completion and publish the event.
    async fn complete(&self, id: &str) -> UploadResult<Upload> {
        let upload = self.store.finalize(id).await?;
        info!(upload_id = %id, size = upload.offset, "upload completed");
        self.notifier.notify(CompletedUpload::from(&upload));
        Ok(upload)
    }

    /// Create a new upload. `size` of `None` defers the length.
    pub async fn create(
        &self,
        size: Option<u64>,
        metadata: Metadata,
        is_partial: bool,
    ) -> UploadResult<Upload> {
        if let Some(size) = size {
            self.ensure_within_max(size)?;
        }

        let upload = self
            .store
            .create(NewUpload {
                size,
                metadata,
                is_partial,
                ..Default::default()
            })
            .await?;
        debug!(upload_id = %upload.id, size = ?upload.size, "upload created");

        if upload.is_complete() {
            return self.complete(&upload.id).await;
        }
        Ok(upload)
    }

    /// Append `body` at `expected_offset`.
    ///
    /// `declared_length` carries an `Upload-Length` sent along with the chunk,
    /// which is how deferred uploads learn their size.
    pub async fn patch(
        &self,
        id: &str,
        expected_offset: u64,
        declared_length: Option<u64>,
        body: ByteStream,
    ) -> UploadResult<Upload> {
        let _lease = self.locker.try_acquire(id)?;

        let mut upload = self.store.read_meta(id).await?;
        if upload.is_final {
            return Err(UploadError::Forbidden(id.to_string()));
        }
        if upload.is_complete() {
            return Err(UploadError::Gone(id.to_string()));
        }
        if expected_offset != upload.offset {
            return Err(UploadError::OffsetConflict {
                id: id.to_string(),
                expected: expected_offset,
                actual: upload.offset,
            });
        }

        if let Some(length) = declared_length {
            match upload.size {
                None => upload = self.apply_length(&upload, length).await?,
                Some(size) if size == length => {}
                Some(_) => return Err(UploadError::LengthAlreadyDeclared(id.to_string())),
            }
        }

        let limit = upload
            .remaining()
            .unwrap_or_else(|| self.size_limit().saturating_sub(upload.offset));

        let new_offset = self
            .store
            .write_at(id, upload.offset, body, limit)
            .await?;
        debug!(
            upload_id = %id,
            from = upload.offset,
            to = new_offset,
            "chunk written"
        );
        upload.offset = new_offset;

        if upload.is_complete() {
            return self.complete(id).await;
        }
        Ok(upload)
    }

    /// Current offset and length, without taking the lease.
    pub async fn head(&self, id: &str) -> UploadResult<Upload> {
        Ok(self.store.read_meta(id).await?)
    }

    /// Upload record plus its persisted bytes.
    pub async fn get(&self, id: &str) -> UploadResult<(Upload, ByteStream)> {
        let upload = self.store.read_meta(id).await?;
        let content = self.store.read_content(id, 0..upload.offset).await?;
        Ok((upload, content))
    }

    /// Declare the length of a deferred upload.
    pub async fn declare_length(&self, id: &str, size: u64) -> UploadResult<Upload> {
        let _lease = self.locker.try_acquire(id)?;
        let upload = self.store.read_meta(id).await?;
        if upload.size.is_some() {
            return Err(UploadError::LengthAlreadyDeclared(id.to_string()));
        }
        let upload = self.apply_length(&upload, size).await?;
        if upload.is_complete() {
            return self.complete(id).await;
        }
        Ok(upload)
    }

    async fn apply_length(&self, upload: &Upload, size: u64) -> UploadResult<Upload> {
        self.ensure_within_max(size)?;
        if size < upload.offset {
            return Err(UploadError::InvalidLength(format!(
                "length {} is below the {} bytes already received",
                size, upload.offset
            )));
        }
        debug!(upload_id = %upload.id, size, "deferred length declared");
        Ok(self.store.declare_length(&upload.id, size).await?)
    }

    /// Terminate an upload and discard its bytes.
    pub async fn delete(&self, id: &str) -> UploadResult<()> {
        let _lease = self.locker.try_acquire(id)?;
        self.store.delete(id).await?;
        debug!(upload_id = %id, "upload terminated");
        Ok(())
    }

    /// Build a final upload from complete partial uploads, in order.
    pub async fn concat(&self, partials: Vec<String>, metadata: Metadata) -> UploadResult<Upload> {
        if partials.is_empty() {
            return Err(UploadError::InvalidConcat(
                "no partial uploads given".into(),
            ));
        }

        let _leases = partials
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|id| self.locker.try_acquire(id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut total: u64 = 0;
        for id in &partials {
            let partial = self.store.read_meta(id).await?;
            if !partial.is_partial {
                return Err(UploadError::InvalidConcat(format!(
                    "upload `{id}` is not a partial upload"
                )));
            }
            if !partial.is_complete() {
                return Err(UploadError::InvalidConcat(format!(
                    "partial upload `{id}` is not finished"
                )));
            }
            total = total.saturating_add(partial.offset);
        }
        self.ensure_within_max(total)?;

        let created = self
            .store
            .create(NewUpload {
                size: Some(total),
                metadata,
                is_partial: false,
                is_final: true,
                partial_uploads: partials.clone(),
            })
            .await?;

        match self.fill_final(&created.id, &partials).await {
            Ok(upload) => Ok(upload),
            Err(err) => {
                if let Err(cleanup) = self.store.delete(&created.id).await {
                    warn!(
                        upload_id = %created.id,
                        "failed to remove unfinished concatenation: {}", cleanup
                    );
                }
                Err(err)
            }
        }
    }

    async fn fill_final(&self, id: &str, partials: &[String]) -> UploadResult<Upload> {
        let _lease = self.locker.try_acquire(id)?;
        self.store.concat(id, partials).await?;
        self.complete(id).await
    }
}
