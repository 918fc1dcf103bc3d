//! Process-local backend keeping metadata and payload in memory.
//!
//! Chunks are buffered and committed in one step, so readers never see a
//! partially applied write. Useful for tests and throwaway deployments.

use crate::{
    models::upload::{NewUpload, Upload},
    services::store::{ByteStream, DataStore, StoreError, StoreResult, byte_stream, collect_limited},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use std::{ops::Range, sync::Arc};

struct Slot {
    upload: Upload,
    data: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    uploads: Arc<DashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(id: &str) -> StoreError {
        StoreError::NotFound(id.to_string())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, new: NewUpload) -> StoreResult<Upload> {
        let upload = Upload {
            id: Upload::new_id(),
            size: new.size,
            offset: 0,
            metadata: new.metadata,
            is_partial: new.is_partial,
            is_final: new.is_final,
            partial_uploads: new.partial_uploads,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.uploads.insert(
            upload.id.clone(),
            Slot {
                upload: upload.clone(),
                data: Vec::new(),
            },
        );
        Ok(upload)
    }

    async fn write_at(
        &self,
        id: &str,
        offset: u64,
        body: ByteStream,
        limit: u64,
    ) -> StoreResult<u64> {
        let current = self.read_meta(id).await?.offset;
        if current != offset {
            return Err(StoreError::OffsetMismatch {
                id: id.to_string(),
                expected: offset,
                actual: current,
            });
        }

        let chunk = collect_limited(id, body, limit).await?;

        let mut slot = self.uploads.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if slot.upload.offset != offset {
            return Err(StoreError::OffsetMismatch {
                id: id.to_string(),
                expected: offset,
                actual: slot.upload.offset,
            });
        }
        slot.data.extend_from_slice(&chunk);
        slot.upload.offset += chunk.len() as u64;
        Ok(slot.upload.offset)
    }

    async fn read_meta(&self, id: &str) -> StoreResult<Upload> {
        self.uploads
            .get(id)
            .map(|slot| slot.upload.clone())
            .ok_or_else(|| Self::not_found(id))
    }

    async fn read_content(&self, id: &str, range: Range<u64>) -> StoreResult<ByteStream> {
        let slot = self.uploads.get(id).ok_or_else(|| Self::not_found(id))?;
        let end = range.end.min(slot.upload.offset) as usize;
        let start = (range.start as usize).min(end);
        let bytes = Bytes::copy_from_slice(&slot.data[start..end]);
        Ok(byte_stream(futures::stream::iter([Ok(bytes)])))
    }

    async fn declare_length(&self, id: &str, size: u64) -> StoreResult<Upload> {
        let mut slot = self.uploads.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        slot.upload.size = Some(size);
        Ok(slot.upload.clone())
    }

    async fn concat(&self, final_id: &str, partials: &[String]) -> StoreResult<Upload> {
        // Copy out first: holding a partial's guard while locking the final
        // entry can deadlock when both live in the same shard.
        let mut assembled = Vec::new();
        for partial in partials {
            let slot = self
                .uploads
                .get(partial)
                .ok_or_else(|| Self::not_found(partial))?;
            assembled.extend_from_slice(&slot.data[..slot.upload.offset as usize]);
        }

        let mut slot = self
            .uploads
            .get_mut(final_id)
            .ok_or_else(|| Self::not_found(final_id))?;
        slot.upload.offset = assembled.len() as u64;
        slot.data = assembled;
        Ok(slot.upload.clone())
    }

    async fn finalize(&self, id: &str) -> StoreResult<Upload> {
        let mut slot = self.uploads.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if slot.upload.completed_at.is_none() {
            slot.upload.completed_at = Some(Utc::now());
        }
        Ok(slot.upload.clone())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.uploads
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::test_support::{broken, chunks, read_all};

    fn sized(size: u64) -> NewUpload {
        NewUpload {
            size: Some(size),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn appends_at_recorded_offset() {
        let store = MemoryStore::new();
        let upload = store.create(sized(10)).await.unwrap();

        let offset = store
            .write_at(&upload.id, 0, chunks(&[b"hello", b" "]), 10)
            .await
            .unwrap();
        assert_eq!(offset, 6);
        let offset = store
            .write_at(&upload.id, 6, chunks(&[b"worl"]), 4)
            .await
            .unwrap();
        assert_eq!(offset, 10);

        let content = store.read_content(&upload.id, 0..10).await.unwrap();
        assert_eq!(read_all(content).await, b"hello worl");
    }

    #[tokio::test]
    async fn rejects_sparse_and_overlapping_writes() {
        let store = MemoryStore::new();
        let upload = store.create(sized(10)).await.unwrap();
        store
            .write_at(&upload.id, 0, chunks(&[b"abc"]), 10)
            .await
            .unwrap();

        for offset in [0, 2, 4] {
            let err = store
                .write_at(&upload.id, offset, chunks(&[b"x"]), 10)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::OffsetMismatch { actual: 3, .. }));
        }
        assert_eq!(store.read_meta(&upload.id).await.unwrap().offset, 3);
    }

    #[tokio::test]
    async fn failed_stream_leaves_offset_unchanged() {
        let store = MemoryStore::new();
        let upload = store.create(sized(10)).await.unwrap();

        let err = store
            .write_at(&upload.id, 0, broken(&[b"abc"]), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let err = store
            .write_at(&upload.id, 0, chunks(&[b"abcdef"]), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SizeExceeded { limit: 4, .. }));

        assert_eq!(store.read_meta(&upload.id).await.unwrap().offset, 0);
        let content = store.read_content(&upload.id, 0..10).await.unwrap();
        assert!(read_all(content).await.is_empty());
    }

    #[tokio::test]
    async fn concat_joins_partials_in_order() {
        let store = MemoryStore::new();
        let a = store.create(sized(3)).await.unwrap();
        let b = store.create(sized(2)).await.unwrap();
        store.write_at(&a.id, 0, chunks(&[b"abc"]), 3).await.unwrap();
        store.write_at(&b.id, 0, chunks(&[b"de"]), 2).await.unwrap();

        let fin = store.create(sized(5)).await.unwrap();
        let fin = store
            .concat(&fin.id, &[b.id.clone(), a.id.clone()])
            .await
            .unwrap();
        assert_eq!(fin.offset, 5);
        let content = store.read_content(&fin.id, 0..5).await.unwrap();
        assert_eq!(read_all(content).await, b"deabc");
    }

    #[tokio::test]
    async fn delete_forgets_upload() {
        let store = MemoryStore::new();
        let upload = store.create(sized(1)).await.unwrap();
        store.delete(&upload.id).await.unwrap();
        assert!(matches!(
            store.read_meta(&upload.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(&upload.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
