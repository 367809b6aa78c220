//! Remote index client port
//!
//! The search cluster is reached through `RemoteIndexClient`. The wire
//! protocol lives behind the trait; `InMemoryIndexClient` is a process-local
//! cluster used by tests and embedded setups, with knobs for injecting the
//! failures a real cluster produces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCategory;
use crate::fingerprint::IndexSchema;
use crate::producer::SearchDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Cluster cannot be reached at all
    Unavailable,
    /// Index does not exist
    NotFound,
    /// Index already exists
    AlreadyExists,
    /// Request understood and refused (bad mapping, bad document)
    Rejected,
    /// Request failed in flight (timeout, throttling, 5xx)
    Transport,
}

impl RemoteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteErrorKind::Unavailable => "unavailable",
            RemoteErrorKind::NotFound => "not_found",
            RemoteErrorKind::AlreadyExists => "already_exists",
            RemoteErrorKind::Rejected => "rejected",
            RemoteErrorKind::Transport => "transport",
        }
    }
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[{kind}] {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.kind {
            RemoteErrorKind::Unavailable => ErrorCategory::Infrastructure,
            RemoteErrorKind::Transport => ErrorCategory::Transient,
            RemoteErrorKind::NotFound
            | RemoteErrorKind::AlreadyExists
            | RemoteErrorKind::Rejected => ErrorCategory::Permanent,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == RemoteErrorKind::AlreadyExists
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// A document the cluster refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFailure {
    pub id: String,
    pub reason: String,
}

/// Per-document outcome of one bulk request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteResponse {
    pub succeeded: u64,
    pub failures: Vec<DocumentFailure>,
}

#[async_trait]
pub trait RemoteIndexClient: Send + Sync {
    async fn create_remote_index(&self, name: &str, schema: &IndexSchema) -> RemoteResult<()>;

    async fn drop_remote_index(&self, name: &str) -> RemoteResult<()>;

    /// Delete every document, keep the index
    async fn clear_remote_index(&self, name: &str) -> RemoteResult<()>;

    async fn bulk_write(
        &self,
        name: &str,
        documents: &[SearchDocument],
    ) -> RemoteResult<BulkWriteResponse>;

    /// Number of documents; 0 when the index does not exist
    async fn document_count(&self, name: &str) -> RemoteResult<u64>;

    /// User index names (system indexes starting with `.` excluded)
    async fn list_remote_index_names(&self) -> RemoteResult<Vec<String>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory cluster
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct RemoteIndex {
    schema: IndexSchema,
    documents: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
struct FaultPlan {
    unavailable: AtomicBool,
    fail_creates: AtomicBool,
    fail_drops: AtomicBool,
    transient_bulk_failures: AtomicU32,
    bulk_latency_ms: AtomicU64,
    rejected: DashMap<String, String>,
}

/// Process-local `RemoteIndexClient`
#[derive(Clone, Default)]
pub struct InMemoryIndexClient {
    indexes: Arc<DashMap<String, RemoteIndex>>,
    faults: Arc<FaultPlan>,
    bulk_calls: Arc<AtomicU64>,
}

impl InMemoryIndexClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse these document ids on every bulk write
    pub fn reject_documents<I, S>(&self, ids: I, reason: &str)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            self.faults.rejected.insert(id.into(), reason.to_string());
        }
    }

    pub fn clear_rejections(&self) {
        self.faults.rejected.clear();
    }

    /// The next `count` bulk writes fail with a transport error
    pub fn fail_next_bulk_writes(&self, count: u32) {
        self.faults
            .transient_bulk_failures
            .store(count, Ordering::SeqCst);
    }

    /// Every call fails with `Unavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.faults.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_drops(&self, fail: bool) {
        self.faults.fail_drops.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every bulk write
    pub fn set_bulk_latency(&self, latency: Duration) {
        self.faults
            .bulk_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of bulk requests received so far
    pub fn bulk_write_calls(&self) -> u64 {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn index_exists(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    pub fn schema_of(&self, name: &str) -> Option<IndexSchema> {
        self.indexes.get(name).map(|index| index.schema.clone())
    }

    pub fn document(&self, name: &str, id: &str) -> Option<serde_json::Value> {
        self.indexes
            .get(name)
            .and_then(|index| index.documents.get(id).cloned())
    }

    fn check_available(&self) -> RemoteResult<()> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(RemoteError::new(
                RemoteErrorKind::Unavailable,
                "cluster unreachable",
            ));
        }
        Ok(())
    }

    fn take_transient_failure(&self) -> bool {
        self.faults
            .transient_bulk_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
    }
}

fn not_found(name: &str) -> RemoteError {
    RemoteError::new(RemoteErrorKind::NotFound, format!("no such index [{}]", name))
}

#[async_trait]
impl RemoteIndexClient for InMemoryIndexClient {
    async fn create_remote_index(&self, name: &str, schema: &IndexSchema) -> RemoteResult<()> {
        self.check_available()?;
        if self.faults.fail_creates.load(Ordering::SeqCst) {
            return Err(RemoteError::new(
                RemoteErrorKind::Rejected,
                format!("create of [{}] refused", name),
            ));
        }
        if self.indexes.contains_key(name) {
            return Err(RemoteError::new(
                RemoteErrorKind::AlreadyExists,
                format!("index [{}] already exists", name),
            ));
        }
        self.indexes.insert(
            name.to_string(),
            RemoteIndex {
                schema: schema.clone(),
                documents: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn drop_remote_index(&self, name: &str) -> RemoteResult<()> {
        self.check_available()?;
        if self.faults.fail_drops.load(Ordering::SeqCst) {
            return Err(RemoteError::new(
                RemoteErrorKind::Transport,
                format!("delete of [{}] timed out", name),
            ));
        }
        self.indexes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    async fn clear_remote_index(&self, name: &str) -> RemoteResult<()> {
        self.check_available()?;
        let mut index = self.indexes.get_mut(name).ok_or_else(|| not_found(name))?;
        index.documents.clear();
        Ok(())
    }

    async fn bulk_write(
        &self,
        name: &str,
        documents: &[SearchDocument],
    ) -> RemoteResult<BulkWriteResponse> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.faults.bulk_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.check_available()?;
        if self.take_transient_failure() {
            return Err(RemoteError::new(
                RemoteErrorKind::Transport,
                "bulk request timed out",
            ));
        }

        let mut index = self.indexes.get_mut(name).ok_or_else(|| not_found(name))?;
        let mut response = BulkWriteResponse::default();
        for doc in documents {
            match self.faults.rejected.get(&doc.id) {
                Some(reason) => response.failures.push(DocumentFailure {
                    id: doc.id.clone(),
                    reason: reason.value().clone(),
                }),
                None => {
                    index.documents.insert(doc.id.clone(), doc.body.clone());
                    response.succeeded += 1;
                }
            }
        }
        Ok(response)
    }

    async fn document_count(&self, name: &str) -> RemoteResult<u64> {
        self.check_available()?;
        Ok(self
            .indexes
            .get(name)
            .map(|index| index.documents.len() as u64)
            .unwrap_or(0))
    }

    async fn list_remote_index_names(&self) -> RemoteResult<Vec<String>> {
        self.check_available()?;
        let mut names: Vec<String> = self
            .indexes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }
}
