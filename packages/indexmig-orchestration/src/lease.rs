//! Per-version update leases
//!
//! Two updates of the same version would interleave watermark writes, so an
//! update first takes the version's lease. The lease is released when the
//! guard drops. Exclusion is per process; separate processes sharing one
//! catalog must still be serialized by their scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmig_storage::VersionKey;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

#[derive(Clone, Default)]
pub struct UpdateLeases {
    held: Arc<DashMap<VersionKey, DateTime<Utc>>>,
}

/// Held lease; dropping it releases the version
#[derive(Debug)]
pub struct LeaseGuard {
    key: VersionKey,
    held: Arc<DashMap<VersionKey, DateTime<Utc>>>,
}

impl UpdateLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `key`, failing fast when it is already held
    pub fn acquire(&self, key: &VersionKey) -> Result<LeaseGuard> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(entry) => Err(OrchestratorError::ConcurrentModification(format!(
                "{} is being updated since {}",
                key,
                entry.get()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Utc::now());
                debug!("Lease acquired for {}", key);
                Ok(LeaseGuard {
                    key: key.clone(),
                    held: self.held.clone(),
                })
            }
        }
    }

    pub fn is_held(&self, key: &VersionKey) -> bool {
        self.held.contains_key(key)
    }
}

impl LeaseGuard {
    pub fn key(&self) -> &VersionKey {
        &self.key
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
        debug!("Lease released for {}", self.key);
    }
}
