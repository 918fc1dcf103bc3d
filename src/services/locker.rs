//! In-memory, per-upload exclusive leases.
//!
//! The lease table is a sharded `DashMap`, so acquiring a lease for one id
//! never waits on requests for another id. Leases are RAII guards: the entry
//! is removed when the `Lease` is dropped, which covers early returns,
//! panics, and handler futures dropped on client disconnect.
//!
//! Nothing here is durable. A restart forgets every lease, which is harmless
//! because stores re-check the offset on every write.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("upload `{0}` is locked by another request")]
    Busy(String),
}

#[derive(Clone, Default)]
pub struct MemoryLocker {
    leases: Arc<DashMap<String, DateTime<Utc>>>,
}

/// Exclusive right to mutate one upload. Released on drop.
#[derive(Debug)]
pub struct Lease {
    id: String,
    leases: Arc<DashMap<String, DateTime<Utc>>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `id`, failing immediately if another request holds it.
    pub fn try_acquire(&self, id: &str) -> Result<Lease, LockError> {
        match self.leases.entry(id.to_string()) {
            Entry::Occupied(_) => Err(LockError::Busy(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                trace!(upload_id = %id, "lease acquired");
                Ok(Lease {
                    id: id.to_string(),
                    leases: self.leases.clone(),
                })
            }
        }
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.leases.contains_key(id)
    }

    /// Number of leases currently outstanding.
    pub fn held(&self) -> usize {
        self.leases.len()
    }
}

impl Lease {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leases.remove(&self.id);
        trace!(upload_id = %self.id, "lease released");
    }
}
