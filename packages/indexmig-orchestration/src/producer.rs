//! Document producer port
//!
//! Every search-document type implements `DocumentProducer`: it declares the
//! schema its documents are indexed with and yields the documents changed
//! since a watermark. The stream is lazy and finite; it can be restarted
//! from the beginning but not resumed from the middle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fingerprint::IndexSchema;

/// One serialized search document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    /// Primary key in the remote index
    pub id: String,
    pub body: serde_json::Value,
    /// Last modification time in the source of truth
    pub updated_at: DateTime<Utc>,
}

impl SearchDocument {
    pub fn new(id: impl Into<String>, body: serde_json::Value, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            body,
            updated_at,
        }
    }
}

/// Lazy document sequence. An `Err` item means the source itself failed.
pub type DocumentStream = BoxStream<'static, Result<SearchDocument>>;

#[async_trait]
pub trait DocumentProducer: Send + Sync {
    /// Schema (settings and mappings) new versions are created with
    fn schema(&self) -> IndexSchema;

    /// Documents changed at or after `since`; everything when `since` is None
    async fn produce_changed_documents(&self, since: Option<DateTime<Utc>>)
        -> Result<DocumentStream>;
}

/// `DocumentProducer` over an in-process document set
#[derive(Clone)]
pub struct InMemoryDocumentProducer {
    schema: Arc<RwLock<IndexSchema>>,
    documents: Arc<RwLock<Vec<SearchDocument>>>,
}

impl InMemoryDocumentProducer {
    pub fn new(schema: IndexSchema) -> Self {
        Self {
            schema: Arc::new(RwLock::new(schema)),
            documents: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_documents(schema: IndexSchema, documents: Vec<SearchDocument>) -> Self {
        let producer = Self::new(schema);
        *producer.documents.write() = documents;
        producer
    }

    /// Insert or replace a document by id
    pub fn upsert(&self, document: SearchDocument) {
        let mut documents = self.documents.write();
        match documents.iter_mut().find(|d| d.id == document.id) {
            Some(existing) => *existing = document,
            None => documents.push(document),
        }
    }

    pub fn set_schema(&self, schema: IndexSchema) {
        *self.schema.write() = schema;
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl DocumentProducer for InMemoryDocumentProducer {
    fn schema(&self) -> IndexSchema {
        self.schema.read().clone()
    }

    async fn produce_changed_documents(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<DocumentStream> {
        let selected: Vec<SearchDocument> = self
            .documents
            .read()
            .iter()
            .filter(|doc| since.map_or(true, |watermark| doc.updated_at >= watermark))
            .cloned()
            .collect();
        Ok(stream::iter(selected.into_iter().map(Ok)).boxed())
    }
}
