//! Represents a single resumable upload and its persisted form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::{collections::BTreeMap, num::TryFromIntError};
use uuid::Uuid;

/// Largest length any backend accepts. SQLite integers are signed 64-bit.
pub const MAX_UPLOAD_LENGTH: u64 = i64::MAX as u64;

/// User supplied key/value pairs attached to an upload at creation.
pub type Metadata = BTreeMap<String, String>;

/// A resumable upload resource.
///
/// The struct only describes the upload; payload bytes live in the backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    /// Opaque identifier, 32 lowercase hex characters.
    pub id: String,

    /// Declared final length. `None` while the length is deferred.
    pub size: Option<u64>,

    /// Bytes durably persisted so far.
    pub offset: u64,

    /// Decoded `Upload-Metadata` pairs.
    pub metadata: Metadata,

    /// Created with `Upload-Concat: partial`.
    pub is_partial: bool,

    /// Assembled from partial uploads via `Upload-Concat: final`.
    pub is_final: bool,

    /// Ids of the partial uploads a final upload was built from, in order.
    pub partial_uploads: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Lifecycle state derived from size and offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Deferred,
    Created,
    Uploading,
    Completed,
}

impl Upload {
    pub fn new_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn state(&self) -> UploadState {
        match self.size {
            None => UploadState::Deferred,
            Some(size) if self.offset >= size => UploadState::Completed,
            Some(_) if self.offset == 0 => UploadState::Created,
            Some(_) => UploadState::Uploading,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state() == UploadState::Completed
    }

    /// Bytes still accepted before the declared length is reached.
    pub fn remaining(&self) -> Option<u64> {
        self.size.map(|size| size.saturating_sub(self.offset))
    }
}

/// Parameters for a new upload record.
#[derive(Clone, Debug, Default)]
pub struct NewUpload {
    pub size: Option<u64>,
    pub metadata: Metadata,
    pub is_partial: bool,
    pub is_final: bool,
    pub partial_uploads: Vec<String>,
}

/// Row layout of the `uploads` table.
#[derive(Clone, FromRow, Debug)]
pub struct UploadRow {
    pub id: String,
    pub size: Option<i64>,
    pub upload_offset: i64,
    pub metadata: Json<Metadata>,
    pub is_partial: bool,
    pub is_final: bool,
    pub partial_uploads: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fails on negative lengths or offsets instead of clamping them.
impl TryFrom<UploadRow> for Upload {
    type Error = TryFromIntError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            size: row.size.map(u64::try_from).transpose()?,
            offset: u64::try_from(row.upload_offset)?,
            metadata: row.metadata.0,
            is_partial: row.is_partial,
            is_final: row.is_final,
            partial_uploads: row.partial_uploads.0,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}
