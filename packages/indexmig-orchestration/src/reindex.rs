//! Reindexing engine
//!
//! One `update` call streams the producer's documents into a version:
//!
//! ```text
//! producer stream ──► feeder ──(BatchDescriptor)──► worker × N ──► bulk_write
//!                                                      │
//!                     coordinator ◄──(BatchReport)─────┘
//! ```
//!
//! The feeder cuts the stream into numbered batches and sends them over a
//! bounded channel, so at most `workers` batches wait in memory. Workers share
//! nothing but the channels. The coordinator folds reports into a `Tally`,
//! heartbeats the action after each batch and decides the outcome:
//!
//! - no failures: `Success`, watermark moves to the run start time
//! - per-document failures: `Partial`, watermark unchanged
//! - infrastructure failure or cancellation: `Failed`, watermark unchanged
//!
//! Each written, rejected or aborted batch is also recorded as a child
//! `Update` action of the run with its counts, retries and runtime. Once the
//! run's action is open, every error path completes it as `Failed` before the
//! error reaches the caller.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use indexmig_storage::{ActionKind, ActionStatus, CatalogStore, IndexVersion, VersionKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::ledger::{ActionHandle, ActionLedger, ActionOrigin};
use crate::lease::UpdateLeases;
use crate::producer::{DocumentProducer, DocumentStream, SearchDocument};
use crate::remote::{BulkWriteResponse, DocumentFailure, RemoteError, RemoteIndexClient};

/// Which documents an update asks the producer for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Documents changed since the version's watermark (everything if unset)
    Resume,
    /// The whole corpus
    Full,
    /// Documents changed since an explicit start time
    Since(DateTime<Utc>),
}

impl UpdateMode {
    /// Cursor handed to the producer
    pub fn cursor(&self, watermark: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        match self {
            UpdateMode::Resume => watermark,
            UpdateMode::Full => None,
            UpdateMode::Since(start) => Some(*start),
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMode::Resume => f.write_str("resume"),
            UpdateMode::Full => f.write_str("full"),
            UpdateMode::Since(start) => write!(f, "since {}", start.to_rfc3339()),
        }
    }
}

/// Tuning for one run
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub failure_sample_limit: usize,
    pub cancel: CancellationToken,
}

impl UpdateOptions {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            workers: config.workers.resolve(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            failure_sample_limit: config.failure_sample_limit,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}

/// Outcome of one `update` run
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub action_id: Uuid,
    pub version: VersionKey,
    pub status: ActionStatus,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u64,
    /// First `failure_sample_limit` failures, not all of them
    pub failure_samples: Vec<DocumentFailure>,
    pub watermark_before: Option<DateTime<Utc>>,
    pub watermark_after: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Batches
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct BatchDescriptor {
    number: u64,
    documents: Vec<SearchDocument>,
}

#[derive(Debug)]
enum BatchOutcome {
    Written(BulkWriteResponse),
    /// Refused as a whole; every document counts as failed
    Rejected(Vec<DocumentFailure>),
    /// Cluster unreachable; the run must stop
    Aborted(RemoteError),
    Cancelled,
}

#[derive(Debug)]
struct BatchReport {
    number: u64,
    attempted: u64,
    retries: u32,
    elapsed: Duration,
    outcome: BatchOutcome,
}

impl BatchReport {
    /// Status, successes, failures and error text of the batch's own action;
    /// None for a batch that was cancelled before it was written
    fn audit(&self) -> Option<(ActionStatus, u64, u64, Option<String>)> {
        match &self.outcome {
            BatchOutcome::Written(response) => {
                let failed = response.failures.len() as u64;
                let status = if failed == 0 {
                    ActionStatus::Success
                } else {
                    ActionStatus::Partial
                };
                Some((status, response.succeeded, failed, None))
            }
            BatchOutcome::Rejected(failures) => Some((
                ActionStatus::Failed,
                0,
                failures.len() as u64,
                failures.first().map(|f| f.reason.clone()),
            )),
            BatchOutcome::Aborted(err) => Some((ActionStatus::Failed, 0, 0, Some(err.to_string()))),
            BatchOutcome::Cancelled => None,
        }
    }
}

/// What `execute` hands back for the run's action to be completed with
struct Finished {
    report: UpdateReport,
    payload: serde_json::Value,
    abort: Option<OrchestratorError>,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Running totals; reports arrive in any order
#[derive(Debug, Default)]
struct Tally {
    attempted: u64,
    succeeded: u64,
    failed: u64,
    batches: u64,
    samples: Vec<DocumentFailure>,
    sample_limit: usize,
    abort: Option<RemoteError>,
}

impl Tally {
    fn new(sample_limit: usize) -> Self {
        Self {
            sample_limit,
            ..Self::default()
        }
    }

    fn absorb(&mut self, report: BatchReport) {
        match report.outcome {
            BatchOutcome::Written(response) => {
                self.batches += 1;
                self.attempted += report.attempted;
                self.succeeded += response.succeeded;
                self.failed += response.failures.len() as u64;
                self.sample(response.failures);
            }
            BatchOutcome::Rejected(failures) => {
                self.batches += 1;
                self.attempted += report.attempted;
                self.failed += failures.len() as u64;
                self.sample(failures);
            }
            BatchOutcome::Aborted(err) => {
                if self.abort.is_none() {
                    self.abort = Some(err);
                }
            }
            BatchOutcome::Cancelled => {}
        }
    }

    fn sample(&mut self, failures: Vec<DocumentFailure>) {
        let room = self.sample_limit.saturating_sub(self.samples.len());
        self.samples.extend(failures.into_iter().take(room));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

pub struct ReindexEngine {
    store: Arc<dyn CatalogStore>,
    client: Arc<dyn RemoteIndexClient>,
    ledger: Arc<ActionLedger>,
    leases: UpdateLeases,
}

impl ReindexEngine {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        client: Arc<dyn RemoteIndexClient>,
        ledger: Arc<ActionLedger>,
        leases: UpdateLeases,
    ) -> Self {
        Self {
            store,
            client,
            ledger,
            leases,
        }
    }

    pub fn leases(&self) -> &UpdateLeases {
        &self.leases
    }

    /// Stream `producer`'s documents into `version`
    ///
    /// Pass a parent `ActionHandle` as `origin` to record the run as a
    /// sub-action of a fan-out.
    pub async fn update<'o>(
        &self,
        key: &VersionKey,
        producer: Arc<dyn DocumentProducer>,
        mode: UpdateMode,
        options: &UpdateOptions,
        origin: impl Into<ActionOrigin<'o>>,
    ) -> Result<UpdateReport> {
        let origin: ActionOrigin<'_> = origin.into();
        let version = self
            .store
            .get_version(key)
            .await?
            .ok_or_else(|| OrchestratorError::NameResolution(key.to_string()))?;
        if !version.is_built() {
            return Err(OrchestratorError::VersionNotBuilt(key.to_string()));
        }

        let _lease = self.leases.acquire(key)?;
        let mut handle = self
            .ledger
            .open(ActionKind::Update, key.clone(), origin)
            .await?;

        match self
            .execute(&mut handle, version, producer, mode, options)
            .await
        {
            Ok(finished) => {
                handle.set_docs_affected(finished.report.succeeded);
                self.ledger
                    .complete(handle, finished.report.status, finished.payload)
                    .await?;
                match finished.abort {
                    Some(err) => Err(err),
                    None => Ok(finished.report),
                }
            }
            Err(err) => {
                self.ledger.fail(handle, &err).await?;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        handle: &mut ActionHandle,
        version: IndexVersion,
        producer: Arc<dyn DocumentProducer>,
        mode: UpdateMode,
        options: &UpdateOptions,
    ) -> Result<Finished> {
        let clock = Instant::now();
        let started_at = handle.started_at();
        let remote_name = version.remote_name();
        let watermark_before = version.last_successful_update;
        let cursor = mode.cursor(watermark_before);

        let current = producer.schema().fingerprint();
        if current != version.fingerprint {
            handle.warn(format!(
                "Schema of {} differs from the running code (fingerprint {} vs {}); \
                 documents may not match the mappings",
                remote_name,
                &version.fingerprint[..12.min(version.fingerprint.len())],
                &current[..12]
            ));
        }

        let workers = options.workers.max(1);
        let batch_size = options.batch_size.max(1);
        handle.log(format!(
            "Updating {} ({}, changed since {}, {} workers, batches of {})",
            remote_name,
            mode,
            cursor.map_or_else(|| "the beginning".to_string(), |c| c.to_rfc3339()),
            workers,
            batch_size
        ));

        let (tally, source_error) = match producer.produce_changed_documents(cursor).await {
            Ok(stream) => {
                self.pump(handle, stream, &version, workers, batch_size, options)
                    .await
            }
            Err(e) => (Tally::new(options.failure_sample_limit), Some(e)),
        };

        let cancelled = options.cancel.is_cancelled();
        let abort = match (source_error, &tally.abort) {
            (Some(e), _) => Some(e),
            (None, Some(remote)) => Some(OrchestratorError::RemoteBulkWrite {
                name: remote_name.clone(),
                reason: remote.to_string(),
            }),
            (None, None) => None,
        };
        let status = if abort.is_some() || cancelled {
            ActionStatus::Failed
        } else if tally.failed > 0 {
            ActionStatus::Partial
        } else {
            ActionStatus::Success
        };

        let mut version = self
            .store
            .get_version(&version.key)
            .await?
            .ok_or_else(|| OrchestratorError::NameResolution(version.key.to_string()))?;
        version.last_attempted_update = Some(started_at);
        if status == ActionStatus::Success {
            version.last_successful_update = Some(started_at);
        }
        match self.client.document_count(&remote_name).await {
            Ok(count) => version.doc_count = count,
            Err(e) => warn!("Could not refresh document count of {}: {}", remote_name, e),
        }
        self.store.update_version(&version).await?;

        match (&abort, status) {
            (Some(err), _) => handle.warn(format!("Update aborted: {}", err)),
            (None, ActionStatus::Failed) => handle.warn("Update cancelled before completion"),
            (None, ActionStatus::Partial) => {
                handle.warn(
                    OrchestratorError::PartialUpdateFailure {
                        version: remote_name.clone(),
                        attempted: tally.attempted,
                        failed: tally.failed,
                    }
                    .to_string(),
                );
                for failure in &tally.samples {
                    handle.log(format!("  {}: {}", failure.id, failure.reason));
                }
            }
            (None, _) => handle.log(format!(
                "Indexed {} documents into {} in {} batches",
                tally.succeeded, remote_name, tally.batches
            )),
        }

        let report = UpdateReport {
            action_id: handle.id(),
            version: version.key.clone(),
            status,
            attempted: tally.attempted,
            succeeded: tally.succeeded,
            failed: tally.failed,
            batches: tally.batches,
            failure_samples: tally.samples,
            watermark_before,
            watermark_after: version.last_successful_update,
            cancelled,
            duration: clock.elapsed(),
        };

        let payload = json!({
            "mode": mode.to_string(),
            "attempted": report.attempted,
            "succeeded": report.succeeded,
            "failed": report.failed,
            "batches": report.batches,
            "failure_samples": report.failure_samples,
            "watermark_before": report.watermark_before,
            "watermark_after": report.watermark_after,
            "cancelled": cancelled,
            "error": abort.as_ref().map(|e| e.to_string()),
        });
        Ok(Finished {
            report,
            payload,
            abort,
        })
    }

    /// Run feeder and workers to completion, folding reports as they arrive
    async fn pump(
        &self,
        handle: &mut ActionHandle,
        stream: DocumentStream,
        version: &IndexVersion,
        workers: usize,
        batch_size: usize,
        options: &UpdateOptions,
    ) -> (Tally, Option<OrchestratorError>) {
        let remote_name = version.remote_name();
        // Aborting a run must not cancel the caller's token
        let run_cancel = options.cancel.child_token();
        let policy = RetryPolicy {
            max_retries: options.max_retries,
            backoff: options.retry_backoff,
        };

        let (batch_tx, batch_rx) = mpsc::channel::<BatchDescriptor>(workers);
        let (report_tx, mut report_rx) = mpsc::channel::<BatchReport>(workers);
        let batch_rx = Arc::new(Mutex::new(batch_rx));

        let feeder = tokio::spawn(feed_batches(
            stream,
            batch_size,
            batch_tx,
            run_cancel.clone(),
        ));

        let name: Arc<str> = Arc::from(remote_name.as_str());
        let pool: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    batch_rx.clone(),
                    report_tx.clone(),
                    self.client.clone(),
                    name.clone(),
                    policy,
                    run_cancel.clone(),
                ))
            })
            .collect();
        drop(report_tx);

        let mut tally = Tally::new(options.failure_sample_limit);
        while let Some(report) = report_rx.recv().await {
            let number = report.number;
            let retries = report.retries;
            let aborted = matches!(report.outcome, BatchOutcome::Aborted(_));
            self.record_batch(handle, &version.key, &report).await;
            tally.absorb(report);

            if aborted {
                error!("Batch {} of {} hit an unreachable cluster; stopping", number, remote_name);
                run_cancel.cancel();
                continue;
            }
            debug!(
                "Batch {} of {} done ({} retries): {} ok, {} failed so far",
                number, remote_name, retries, tally.succeeded, tally.failed
            );
            if let Err(e) = self.ledger.heartbeat(handle, tally.succeeded).await {
                warn!("Heartbeat for action {} failed: {}", handle.id(), e);
            }
        }

        let fed = match feeder.await {
            Ok(fed) => fed,
            Err(e) => Err(OrchestratorError::DocumentSource(format!(
                "document feeder ended abnormally: {}",
                e
            ))),
        };
        for task in futures::future::join_all(pool).await {
            if let Err(e) = task {
                warn!("Reindex worker ended abnormally: {}", e);
            }
        }

        let source_error = match fed {
            Ok(batches) => {
                info!("Fed {} batches to {}", batches, remote_name);
                None
            }
            Err(e) => Some(e),
        };
        (tally, source_error)
    }

    /// Record `report` as a completed child action of the run
    ///
    /// A batch whose audit row cannot be written is only logged; the run
    /// itself goes on.
    async fn record_batch(&self, parent: &ActionHandle, key: &VersionKey, report: &BatchReport) {
        let Some((status, succeeded, failed, error)) = report.audit() else {
            return;
        };
        let recorded = async {
            let mut child = self
                .ledger
                .child_of(parent, ActionKind::Update, key.clone())
                .await?;
            child.set_docs_affected(succeeded);
            let payload = json!({
                "batch": report.number,
                "attempted": report.attempted,
                "succeeded": succeeded,
                "failed": failed,
                "retries": report.retries,
                "elapsed_ms": report.elapsed.as_millis() as u64,
                "error": error,
            });
            self.ledger.complete(child, status, payload).await
        }
        .await;
        if let Err(e) = recorded {
            warn!(
                "Could not record batch {} of action {}: {}",
                report.number,
                parent.id(),
                e
            );
        }
    }
}

/// Cut the stream into numbered batches; returns how many were sent
async fn feed_batches(
    mut stream: DocumentStream,
    batch_size: usize,
    tx: mpsc::Sender<BatchDescriptor>,
    cancel: CancellationToken,
) -> Result<u64> {
    let mut number = 0u64;
    let mut buffer = Vec::with_capacity(batch_size);

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Ok(number),
            item = stream.next() => item,
        };
        match item {
            Some(Ok(document)) => buffer.push(document),
            Some(Err(e)) => return Err(e),
            None => break,
        }
        if buffer.len() == batch_size {
            number += 1;
            let documents = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
            if !send_batch(&tx, &cancel, BatchDescriptor { number, documents }).await {
                return Ok(number - 1);
            }
        }
    }

    if !buffer.is_empty() {
        number += 1;
        if !send_batch(&tx, &cancel, BatchDescriptor { number, documents: buffer }).await {
            return Ok(number - 1);
        }
    }
    Ok(number)
}

async fn send_batch(
    tx: &mpsc::Sender<BatchDescriptor>,
    cancel: &CancellationToken,
    batch: BatchDescriptor,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(batch) => sent.is_ok(),
    }
}

async fn run_worker(
    worker_id: usize,
    batches: Arc<Mutex<mpsc::Receiver<BatchDescriptor>>>,
    reports: mpsc::Sender<BatchReport>,
    client: Arc<dyn RemoteIndexClient>,
    name: Arc<str>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = batches.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                batch = rx.recv() => batch,
            }
        };
        let Some(batch) = next else {
            break;
        };

        let report = write_batch(client.as_ref(), &name, batch, policy, &cancel).await;
        if reports.send(report).await.is_err() {
            break;
        }
    }
    debug!("Reindex worker {} for {} exiting", worker_id, name);
}

/// One bulk request with retries on transient errors
async fn write_batch(
    client: &dyn RemoteIndexClient,
    name: &str,
    batch: BatchDescriptor,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> BatchReport {
    let attempted = batch.documents.len() as u64;
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        let err = match client.bulk_write(name, &batch.documents).await {
            Ok(response) => {
                return BatchReport {
                    number: batch.number,
                    attempted,
                    retries: attempt,
                    elapsed: started.elapsed(),
                    outcome: BatchOutcome::Written(response),
                }
            }
            Err(e) => e,
        };

        let category = err.category();
        if category == ErrorCategory::Transient && attempt < policy.max_retries {
            let delay = policy.delay(attempt);
            attempt += 1;
            warn!(
                "Batch {} of {} failed ({}), retry {}/{} in {:?}",
                batch.number, name, err, attempt, policy.max_retries, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return BatchReport {
                        number: batch.number,
                        attempted,
                        retries: attempt,
                        elapsed: started.elapsed(),
                        outcome: BatchOutcome::Cancelled,
                    }
                }
                _ = tokio::time::sleep(delay) => continue,
            }
        }

        let outcome = match category {
            ErrorCategory::Infrastructure => BatchOutcome::Aborted(err),
            _ => {
                warn!("Batch {} of {} rejected: {}", batch.number, name, err);
                let reason = err.to_string();
                BatchOutcome::Rejected(
                    batch
                        .documents
                        .iter()
                        .map(|doc| DocumentFailure {
                            id: doc.id.clone(),
                            reason: reason.clone(),
                        })
                        .collect(),
                )
            }
        };
        return BatchReport {
            number: batch.number,
            attempted,
            retries: attempt,
            elapsed: started.elapsed(),
            outcome,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::IndexSchema;
    use crate::naming::IndexNamer;
    use crate::producer::InMemoryDocumentProducer;
    use crate::remote::InMemoryIndexClient;
    use crate::versions::VersionStateMachine;
    use indexmig_storage::{InMemoryCatalog, IndexAction, NewVersion};

    struct Fixture {
        store: Arc<InMemoryCatalog>,
        client: Arc<InMemoryIndexClient>,
        engine: ReindexEngine,
        key: VersionKey,
    }

    fn schema() -> IndexSchema {
        IndexSchema::new(json!({"properties": {"title": {"type": "text"}}}))
    }

    fn documents(count: usize) -> Vec<SearchDocument> {
        let base = Utc::now() - chrono::Duration::hours(1);
        (0..count)
            .map(|i| {
                SearchDocument::new(
                    format!("doc-{}", i),
                    json!({"title": format!("Title {}", i)}),
                    base + chrono::Duration::seconds(i as i64),
                )
            })
            .collect()
    }

    fn producer(count: usize) -> Arc<InMemoryDocumentProducer> {
        Arc::new(InMemoryDocumentProducer::with_documents(
            schema(),
            documents(count),
        ))
    }

    fn options() -> UpdateOptions {
        UpdateOptions::default()
            .with_batch_size(10)
            .with_workers(1)
            .with_retry_backoff(Duration::from_millis(1))
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryCatalog::new());
        let client = Arc::new(InMemoryIndexClient::new());
        let ledger = Arc::new(ActionLedger::new(
            store.clone(),
            chrono::Duration::minutes(10),
        ));
        let machine = VersionStateMachine::new(
            store.clone(),
            client.clone(),
            ledger.clone(),
            IndexNamer::new(""),
            "test",
        );
        let created = machine
            .create_version("movies", &schema(), false, "")
            .await
            .unwrap();
        let key = created.version.unwrap().key;
        let engine = ReindexEngine::new(
            store.clone(),
            client.clone(),
            ledger,
            UpdateLeases::new(),
        );
        Fixture {
            store,
            client,
            engine,
            key,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tally / Mode Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_mode_cursor() {
        let watermark = Utc::now();
        let explicit = watermark - chrono::Duration::days(1);

        assert_eq!(UpdateMode::Resume.cursor(Some(watermark)), Some(watermark));
        assert_eq!(UpdateMode::Resume.cursor(None), None);
        assert_eq!(UpdateMode::Full.cursor(Some(watermark)), None);
        assert_eq!(
            UpdateMode::Since(explicit).cursor(Some(watermark)),
            Some(explicit)
        );
    }

    #[test]
    fn test_tally_bounds_samples() {
        let mut tally = Tally::new(3);
        let failures: Vec<DocumentFailure> = (0..5)
            .map(|i| DocumentFailure {
                id: format!("doc-{}", i),
                reason: "mapper_parsing_exception".to_string(),
            })
            .collect();

        tally.absorb(BatchReport {
            number: 1,
            attempted: 5,
            retries: 0,
            elapsed: Duration::ZERO,
            outcome: BatchOutcome::Rejected(failures),
        });
        tally.absorb(BatchReport {
            number: 2,
            attempted: 5,
            retries: 0,
            elapsed: Duration::ZERO,
            outcome: BatchOutcome::Written(BulkWriteResponse {
                succeeded: 5,
                failures: vec![],
            }),
        });

        assert_eq!(tally.attempted, 10);
        assert_eq!(tally.succeeded, 5);
        assert_eq!(tally.failed, 5);
        assert_eq!(tally.batches, 2);
        assert_eq!(tally.samples.len(), 3);
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.delay(0), Duration::from_secs(2));
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(16));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Engine Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_full_update_success_advances_watermark() {
        let f = fixture().await;

        let report = f
            .engine
            .update(&f.key, producer(25), UpdateMode::Full, &options(), "")
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.attempted, 25);
        assert_eq!(report.succeeded, 25);
        assert_eq!(report.batches, 3);

        let version = f.store.get_version(&f.key).await.unwrap().unwrap();
        assert_eq!(version.doc_count, 25);
        assert_eq!(version.last_successful_update, report.watermark_after);
        assert_eq!(version.last_attempted_update, report.watermark_after);

        let action = f.store.get_action(report.action_id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Success);
        assert_eq!(action.docs_affected, 25);
        assert_eq!(version.last_successful_update, Some(action.started_at));
    }

    #[tokio::test]
    async fn test_empty_corpus_is_success() {
        let f = fixture().await;

        let report = f
            .engine
            .update(&f.key, producer(0), UpdateMode::Resume, &options(), "")
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.batches, 0);
        assert!(report.watermark_after.is_some());
        assert_eq!(f.client.bulk_write_calls(), 0);
    }

    #[tokio::test]
    async fn test_partial_keeps_watermark() {
        let f = fixture().await;
        f.client.reject_documents(["doc-3", "doc-4"], "mapper_parsing_exception");

        let report = f
            .engine
            .update(&f.key, producer(20), UpdateMode::Full, &options(), "")
            .await
            .unwrap();

        assert_eq!(report.status, ActionStatus::Partial);
        assert_eq!(report.attempted, 20);
        assert_eq!(report.succeeded, 18);
        assert_eq!(report.failed, 2);
        assert_eq!(report.failure_samples.len(), 2);
        assert!(report.watermark_after.is_none());

        let version = f.store.get_version(&f.key).await.unwrap().unwrap();
        assert!(version.last_successful_update.is_none());
        assert!(version.last_attempted_update.is_some());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let f = fixture().await;
        f.client.fail_next_bulk_writes(2);

        let report = f
            .engine
            .update(&f.key, producer(10), UpdateMode::Full, &options(), "")
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(f.client.bulk_write_calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_batch() {
        let f = fixture().await;
        f.client.fail_next_bulk_writes(10);
        let mut opts = options();
        opts.max_retries = 1;

        let report = f
            .engine
            .update(&f.key, producer(10), UpdateMode::Full, &opts, "")
            .await
            .unwrap();

        assert_eq!(report.status, ActionStatus::Partial);
        assert_eq!(report.failed, 10);
        assert_eq!(f.client.bulk_write_calls(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_fails_run() {
        let f = fixture().await;
        f.client.set_unavailable(true);

        let err = f
            .engine
            .update(&f.key, producer(30), UpdateMode::Full, &options(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RemoteBulkWrite { .. }));

        let action = f
            .store
            .latest_action_for("movies", Some(&f.key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action.kind, ActionKind::Update);
        assert_eq!(action.status, ActionStatus::Failed);

        let version = f.store.get_version(&f.key).await.unwrap().unwrap();
        assert!(version.last_successful_update.is_none());
        assert!(version.last_attempted_update.is_some());
    }

    #[tokio::test]
    async fn test_resume_only_sends_changed_documents() {
        let f = fixture().await;
        let source = producer(10);
        f.engine
            .update(&f.key, source.clone(), UpdateMode::Full, &options(), "")
            .await
            .unwrap();

        source.upsert(SearchDocument::new(
            "doc-3",
            json!({"title": "Changed"}),
            Utc::now() + chrono::Duration::seconds(1),
        ));
        let report = f
            .engine
            .update(&f.key, source, UpdateMode::Resume, &options(), "")
            .await
            .unwrap();

        assert_eq!(report.attempted, 1);
        assert_eq!(
            f.client.document("movies-1", "doc-3").unwrap()["title"],
            "Changed"
        );
    }

    #[tokio::test]
    async fn test_concurrent_update_is_refused() {
        let f = fixture().await;
        let _held = f.engine.leases().acquire(&f.key).unwrap();

        let err = f
            .engine
            .update(&f.key, producer(5), UpdateMode::Full, &options(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_declared_version_is_refused() {
        let f = fixture().await;
        let declared = f
            .store
            .allocate_version(NewVersion::new(
                "movies",
                "",
                schema().fingerprint(),
                schema().as_json().clone(),
                "test",
            ))
            .await
            .unwrap();

        let err = f
            .engine
            .update(&declared.key, producer(5), UpdateMode::Full, &options(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::VersionNotBuilt(_)));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Audit Tests
    // ═══════════════════════════════════════════════════════════════════════

    async fn batch_actions(f: &Fixture, parent: Uuid) -> Vec<IndexAction> {
        let mut children: Vec<IndexAction> = f
            .store
            .actions_between(Utc::now() - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.parent == Some(parent))
            .collect();
        children.sort_by_key(|a| a.payload["batch"].as_u64());
        children
    }

    #[tokio::test]
    async fn test_each_batch_is_recorded() {
        let f = fixture().await;

        let report = f
            .engine
            .update(&f.key, producer(25), UpdateMode::Full, &options(), "")
            .await
            .unwrap();

        let children = batch_actions(&f, report.action_id).await;
        assert_eq!(children.len(), 3);
        for (i, child) in children.iter().enumerate() {
            assert_eq!(child.kind, ActionKind::Update);
            assert_eq!(child.status, ActionStatus::Success);
            assert_eq!(child.version, Some(f.key.clone()));
            assert_eq!(child.payload["batch"], i as u64 + 1);
            assert_eq!(child.payload["retries"], 0);
            assert!(child.payload["elapsed_ms"].is_u64());
        }
        let attempted: u64 = children
            .iter()
            .filter_map(|c| c.payload["attempted"].as_u64())
            .sum();
        assert_eq!(attempted, 25);
        assert_eq!(children[2].docs_affected, 5);
    }

    #[tokio::test]
    async fn test_batch_records_failures_and_retries() {
        let f = fixture().await;
        f.client.fail_next_bulk_writes(1);
        f.client.reject_documents(["doc-12"], "mapper_parsing_exception");

        let report = f
            .engine
            .update(&f.key, producer(20), UpdateMode::Full, &options(), "")
            .await
            .unwrap();
        assert_eq!(report.status, ActionStatus::Partial);

        let children = batch_actions(&f, report.action_id).await;
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].payload["retries"], 1);
        assert_eq!(children[0].status, ActionStatus::Success);
        assert_eq!(children[1].status, ActionStatus::Partial);
        assert_eq!(children[1].payload["failed"], 1);
        assert_eq!(children[1].payload["succeeded"], 9);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Failure Path Tests
    // ═══════════════════════════════════════════════════════════════════════

    struct PanickingProducer;

    #[async_trait::async_trait]
    impl DocumentProducer for PanickingProducer {
        fn schema(&self) -> IndexSchema {
            schema()
        }

        async fn produce_changed_documents(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<DocumentStream> {
            Ok(futures::stream::iter(0..1)
                .map(|_| -> Result<SearchDocument> { panic!("source cursor lost") })
                .boxed())
        }
    }

    /// Deletes the version it is asked to fill before yielding anything
    struct VanishingProducer {
        store: Arc<InMemoryCatalog>,
        key: VersionKey,
    }

    #[async_trait::async_trait]
    impl DocumentProducer for VanishingProducer {
        fn schema(&self) -> IndexSchema {
            schema()
        }

        async fn produce_changed_documents(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<DocumentStream> {
            self.store.delete_version(&self.key).await?;
            Ok(futures::stream::empty().boxed())
        }
    }

    #[tokio::test]
    async fn test_feeder_panic_fails_action() {
        let f = fixture().await;

        let err = f
            .engine
            .update(&f.key, Arc::new(PanickingProducer), UpdateMode::Full, &options(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DocumentSource(_)));

        assert!(f.store.in_progress_actions().await.unwrap().is_empty());
        let action = f
            .store
            .latest_action_for("movies", Some(&f.key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action.status, ActionStatus::Failed);
        assert!(action.payload["error"].is_string());
        assert!(f.engine.leases().acquire(&f.key).is_ok());
    }

    #[tokio::test]
    async fn test_version_lost_mid_run_fails_action() {
        let f = fixture().await;
        let vanishing = Arc::new(VanishingProducer {
            store: f.store.clone(),
            key: f.key.clone(),
        });

        let err = f
            .engine
            .update(&f.key, vanishing, UpdateMode::Full, &options(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NameResolution(_)));

        assert!(f.store.in_progress_actions().await.unwrap().is_empty());
        let action = f
            .store
            .latest_action_for("movies", Some(&f.key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action.kind, ActionKind::Update);
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(action.payload["category"], err.category().as_str());
    }
}
