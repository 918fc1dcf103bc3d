//! src/services/disk_store.rs
//!
//! DiskStore keeps upload metadata in SQLite and payloads on local disk,
//! sharded beneath `base_path/{shard}/{shard}/{id}`.
//!
//! The payload is always written and fsynced before the metadata offset is
//! advanced, and the offset update is a compare-and-set on the previous
//! offset. A payload file may therefore be longer than the recorded offset
//! (a write interrupted by a dropped connection), never shorter. Readers cap
//! at the recorded offset and the next write truncates the stale tail.

use crate::{
    models::upload::{MAX_UPLOAD_LENGTH, NewUpload, Upload, UploadRow},
    services::store::{ByteStream, DataStore, StoreError, StoreResult, byte_stream},
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use sqlx::{SqlitePool, types::Json};
use std::{
    io::{self, ErrorKind, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const UPLOAD_COLUMNS: &str = "id, size, upload_offset, metadata, is_partial, is_final, \
                              partial_uploads, created_at, completed_at";

/// Lengths and offsets are stored as SQLite's signed integers.
fn db_int(id: &str, value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::SizeExceeded {
        id: id.to_string(),
        limit: MAX_UPLOAD_LENGTH,
    })
}

/// Turn a single-row query result into an `Upload`.
fn upload_from_row(id: &str, result: Result<UploadRow, sqlx::Error>) -> StoreResult<Upload> {
    let row = result.map_err(|err| match err {
        sqlx::Error::RowNotFound => StoreError::NotFound(id.to_string()),
        other => StoreError::Sqlx(other),
    })?;
    Upload::try_from(row).map_err(|err| StoreError::Corrupt {
        id: id.to_string(),
        reason: err.to_string(),
    })
}

#[derive(Clone)]
pub struct DiskStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,
}

impl DiskStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} migration statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Two-level shard directories from MD5(id), as lowercase hex.
    fn upload_shards(id: &str) -> (String, String) {
        let digest = md5::compute(id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn upload_path(&self, id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::upload_shards(id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id);
        path
    }

    async fn fetch_upload(&self, id: &str) -> StoreResult<Upload> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await;
        upload_from_row(id, row)
    }

    /// Open the payload for writing, creating parent directories as needed.
    async fn open_payload(&self, id: &str) -> StoreResult<File> {
        let path = self.upload_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?)
    }

    /// Copy `body` into `file` starting at `offset`; returns bytes written.
    async fn stream_into(
        id: &str,
        file: &mut File,
        offset: u64,
        mut body: ByteStream,
        limit: u64,
    ) -> StoreResult<u64> {
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if written + chunk.len() as u64 > limit {
                return Err(StoreError::SizeExceeded {
                    id: id.to_string(),
                    limit,
                });
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Remove empty shard directories up to `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl DataStore for DiskStore {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn create(&self, new: NewUpload) -> StoreResult<Upload> {
        let id = Upload::new_id();
        let size = new.size.map(|size| db_int(&id, size)).transpose()?;
        // Create the payload first so a metadata row never points at nothing.
        self.open_payload(&id).await?;

        let inserted = sqlx::query_as::<_, UploadRow>(&format!(
            "INSERT INTO uploads (
                id, size, upload_offset, metadata, is_partial, is_final,
                partial_uploads, created_at, completed_at
            ) VALUES (?, ?, 0, ?, ?, ?, ?, ?, NULL)
            RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(&id)
        .bind(size)
        .bind(Json(&new.metadata))
        .bind(new.is_partial)
        .bind(new.is_final)
        .bind(Json(&new.partial_uploads))
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        if inserted.is_err() {
            let _ = fs::remove_file(self.upload_path(&id)).await;
        }
        upload_from_row(&id, inserted)
    }

    async fn write_at(
        &self,
        id: &str,
        offset: u64,
        body: ByteStream,
        limit: u64,
    ) -> StoreResult<u64> {
        let upload = self.fetch_upload(id).await?;
        if upload.offset != offset {
            return Err(StoreError::OffsetMismatch {
                id: id.to_string(),
                expected: offset,
                actual: upload.offset,
            });
        }

        let mut file = self.open_payload(id).await?;
        let written = match Self::stream_into(id, &mut file, offset, body, limit).await {
            Ok(written) => written,
            Err(err) => {
                if let Err(trunc_err) = file.set_len(offset).await {
                    debug!(upload_id = %id, "failed to roll back payload: {}", trunc_err);
                }
                return Err(err);
            }
        };

        let new_offset = offset + written;
        let result = sqlx::query(
            "UPDATE uploads SET upload_offset = ? WHERE id = ? AND upload_offset = ?",
        )
        .bind(db_int(id, new_offset)?)
        .bind(id)
        .bind(db_int(id, offset)?)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self.fetch_upload(id).await?.offset;
            return Err(StoreError::OffsetMismatch {
                id: id.to_string(),
                expected: offset,
                actual,
            });
        }

        Ok(new_offset)
    }

    async fn read_meta(&self, id: &str) -> StoreResult<Upload> {
        self.fetch_upload(id).await
    }

    async fn read_content(&self, id: &str, range: Range<u64>) -> StoreResult<ByteStream> {
        let upload = self.fetch_upload(id).await?;
        let end = range.end.min(upload.offset);
        let start = range.start.min(end);

        let mut file = File::open(self.upload_path(id)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(id.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(byte_stream(ReaderStream::new(file.take(end - start))))
    }

    async fn declare_length(&self, id: &str, size: u64) -> StoreResult<Upload> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "UPDATE uploads SET size = ? WHERE id = ? RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(db_int(id, size)?)
        .bind(id)
        .fetch_one(&*self.db)
        .await;
        upload_from_row(id, row)
    }

    async fn concat(&self, final_id: &str, partials: &[String]) -> StoreResult<Upload> {
        let mut target = self.open_payload(final_id).await?;
        target.set_len(0).await?;

        let mut total: u64 = 0;
        for partial in partials {
            let upload = self.fetch_upload(partial).await?;
            let source = File::open(self.upload_path(partial)).await?;
            let mut limited = source.take(upload.offset);
            total += tokio::io::copy(&mut limited, &mut target).await?;
        }
        target.flush().await?;
        target.sync_all().await?;

        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "UPDATE uploads SET upload_offset = ? WHERE id = ? RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(db_int(final_id, total)?)
        .bind(final_id)
        .fetch_one(&*self.db)
        .await;
        upload_from_row(final_id, row)
    }

    async fn finalize(&self, id: &str) -> StoreResult<Upload> {
        let row = sqlx::query_as::<_, UploadRow>(&format!(
            "UPDATE uploads SET completed_at = COALESCE(completed_at, ?)
             WHERE id = ? RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&*self.db)
        .await;
        upload_from_row(id, row)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let path = self.upload_path(id);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed payload {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// Runs `SELECT 1` and a write/read/delete round trip under `base_path`.
    async fn check_ready(&self) -> StoreResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if one != 1 {
            return Err(StoreError::Io(io::Error::other(format!(
                "unexpected SELECT 1 result: {one}"
            ))));
        }

        fs::create_dir_all(&self.base_path).await?;
        let marker = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&marker, b"readyz").await?;
        let read = fs::read(&marker).await;
        let _ = fs::remove_file(&marker).await;
        if read? != b"readyz" {
            return Err(StoreError::Io(io::Error::other("readiness marker content mismatch")));
        }
        Ok(())
    }
}
