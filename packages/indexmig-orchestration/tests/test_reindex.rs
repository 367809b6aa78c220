/// Integration tests for the reindexing engine
///
/// Concurrency, partial failure, resumability from the watermark,
/// cancellation and per-version exclusion.
use chrono::Utc;
use indexmig_orchestration::{
    ActionStatus, CatalogStore, IndexManager, IndexSchema, InMemoryDocumentProducer,
    InMemoryIndexClient, ManagerConfig, OrchestratorError, RemoteIndexClient, SearchDocument,
    UpdateMode, UpdateOptions, VersionKey, WorkerCount,
};
use indexmig_storage::InMemoryCatalog;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    manager: Arc<IndexManager>,
    client: Arc<InMemoryIndexClient>,
    producer: Arc<InMemoryDocumentProducer>,
}

fn doc_id(i: usize) -> String {
    format!("doc-{:03}", i)
}

fn corpus(count: usize) -> Vec<SearchDocument> {
    let base = Utc::now() - chrono::Duration::hours(2);
    (0..count)
        .map(|i| {
            SearchDocument::new(
                doc_id(i),
                json!({"n": i}),
                base + chrono::Duration::seconds(i as i64),
            )
        })
        .collect()
}

async fn harness(documents: usize, batch_size: usize, workers: usize) -> Harness {
    let client = Arc::new(InMemoryIndexClient::new());
    let config = ManagerConfig {
        batch_size,
        workers: WorkerCount::Fixed(workers),
        retry_backoff_ms: 1,
        ..ManagerConfig::default()
    };
    let manager = IndexManager::new(Arc::new(InMemoryCatalog::new()), client.clone(), config);
    let producer = Arc::new(InMemoryDocumentProducer::with_documents(
        IndexSchema::new(json!({"properties": {"n": {"type": "long"}}})),
        corpus(documents),
    ));
    manager.register("numbers", producer.clone());
    manager.create_and_activate_all().await.unwrap();
    Harness {
        manager: Arc::new(manager),
        client,
        producer,
    }
}

async fn watermark(h: &Harness) -> Option<chrono::DateTime<Utc>> {
    h.manager
        .store()
        .get_version(&VersionKey::new("numbers", 1))
        .await
        .unwrap()
        .unwrap()
        .last_successful_update
}

// ═══════════════════════════════════════════════════════════════════════════
// Partial failure
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_batch_seven_fails_entirely() {
    let h = harness(100, 10, 4).await;
    // Batch #7 holds documents 60..70
    h.client
        .reject_documents((60..70).map(doc_id), "mapper_parsing_exception");

    let outcome = h
        .manager
        .update("numbers", None, UpdateMode::Full, Some(4))
        .await
        .unwrap();

    let report = outcome.report.unwrap();
    assert_eq!(report.attempted, 100);
    assert_eq!(report.succeeded, 90);
    assert_eq!(report.failed, 10);
    assert_eq!(report.batches, 10);
    assert_eq!(report.status, ActionStatus::Partial);
    assert_eq!(outcome.status, ActionStatus::Partial);
    assert!(report.watermark_after.is_none());
    assert_eq!(watermark(&h).await, None);
    assert!(report
        .failure_samples
        .iter()
        .all(|f| f.reason == "mapper_parsing_exception"));

    let action = h
        .manager
        .store()
        .get_action(report.action_id)
        .await
        .unwrap();
    assert_eq!(action.status, ActionStatus::Partial);
    assert_eq!(action.payload["failed"], 10);
    assert_eq!(h.client.document_count("numbers-1").await.unwrap(), 90);
}

#[tokio::test]
async fn test_counts_are_order_independent() {
    for workers in [1, 3, 8] {
        let h = harness(57, 5, workers).await;
        h.client.reject_documents(["doc-000", "doc-056"], "bad");

        let report = h
            .manager
            .update("numbers", None, UpdateMode::Full, None)
            .await
            .unwrap()
            .report
            .unwrap();

        assert_eq!(report.attempted, 57, "workers={}", workers);
        assert_eq!(report.succeeded, 55, "workers={}", workers);
        assert_eq!(report.batches, 12, "workers={}", workers);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Resumability
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_resume_reprocesses_failed_window_only() {
    let h = harness(40, 10, 2).await;

    let first = h
        .manager
        .update("numbers", None, UpdateMode::Full, None)
        .await
        .unwrap()
        .report
        .unwrap();
    assert!(first.is_success());
    let w1 = watermark(&h).await.unwrap();

    // Touch five documents after the first run started
    tokio::time::sleep(Duration::from_millis(5)).await;
    for i in 10..15 {
        h.producer.upsert(SearchDocument::new(
            doc_id(i),
            json!({"n": i, "edited": true}),
            Utc::now(),
        ));
    }
    h.client.reject_documents([doc_id(12)], "version_conflict");

    let partial = h
        .manager
        .update("numbers", None, UpdateMode::Resume, None)
        .await
        .unwrap()
        .report
        .unwrap();
    assert_eq!(partial.status, ActionStatus::Partial);
    assert_eq!(partial.attempted, 5);
    assert_eq!(watermark(&h).await, Some(w1));

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.client.clear_rejections();
    let retried = h
        .manager
        .update("numbers", None, UpdateMode::Resume, None)
        .await
        .unwrap()
        .report
        .unwrap();
    assert!(retried.is_success());
    assert_eq!(retried.watermark_before, Some(w1));
    assert_eq!(retried.attempted, 5);
    assert!(watermark(&h).await.unwrap() > w1);
    assert_eq!(
        h.client.document("numbers-1", &doc_id(12)).unwrap()["edited"],
        true
    );

    let idle = h
        .manager
        .update("numbers", None, UpdateMode::Resume, None)
        .await
        .unwrap()
        .report
        .unwrap();
    assert!(idle.is_success());
    assert_eq!(idle.attempted, 0);
}

#[tokio::test]
async fn test_since_overrides_watermark() {
    let h = harness(30, 10, 1).await;
    h.manager
        .update("numbers", None, UpdateMode::Full, None)
        .await
        .unwrap();

    // corpus timestamps start two hours back, one second apart
    let since = Utc::now() - chrono::Duration::hours(2) + chrono::Duration::seconds(1000);
    let report = h
        .manager
        .update("numbers", None, UpdateMode::Since(since), None)
        .await
        .unwrap()
        .report
        .unwrap();
    assert_eq!(report.attempted, 0);

    let everything = Utc::now() - chrono::Duration::days(1);
    let report = h
        .manager
        .update("numbers", None, UpdateMode::Since(everything), None)
        .await
        .unwrap()
        .report
        .unwrap();
    assert_eq!(report.attempted, 30);
}

// ═══════════════════════════════════════════════════════════════════════════
// Failure modes
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_cancelled_run_is_resumable() {
    let h = harness(100, 10, 2).await;
    h.client.set_bulk_latency(Duration::from_millis(20));

    let cancel = CancellationToken::new();
    let options = UpdateOptions::from_config(h.manager.config()).with_cancel(cancel.clone());
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });

    let outcome = h
        .manager
        .update_with("numbers", None, UpdateMode::Full, &options)
        .await
        .unwrap();
    trigger.await.unwrap();

    let report = outcome.report.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.status, ActionStatus::Failed);
    assert!(report.succeeded < 100);
    assert_eq!(watermark(&h).await, None);

    h.client.set_bulk_latency(Duration::ZERO);
    let resumed = h
        .manager
        .update("numbers", None, UpdateMode::Resume, None)
        .await
        .unwrap()
        .report
        .unwrap();
    assert!(resumed.is_success());
    assert_eq!(resumed.attempted, 100);
    assert_eq!(h.client.document_count("numbers-1").await.unwrap(), 100);
}

#[tokio::test]
async fn test_unreachable_cluster_aborts() {
    let h = harness(20, 5, 2).await;
    h.client.set_unavailable(true);

    let err = h
        .manager
        .update("numbers", None, UpdateMode::Full, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::RemoteBulkWrite { .. }));

    let action = h
        .manager
        .ledger()
        .latest_for("numbers", Some(&VersionKey::new("numbers", 1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.status, ActionStatus::Failed);
    assert!(action.payload["error"].is_string());
    assert_eq!(watermark(&h).await, None);
}

#[tokio::test]
async fn test_concurrent_updates_of_one_version() {
    let h = harness(50, 10, 1).await;
    h.client.set_bulk_latency(Duration::from_millis(10));

    let (a, b) = tokio::join!(
        h.manager.update("numbers", None, UpdateMode::Full, None),
        h.manager.update("numbers", None, UpdateMode::Full, None),
    );

    let results = [a, b];
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(OrchestratorError::ConcurrentModification(_))))
        .count();
    let finished = results
        .iter()
        .filter(|r| matches!(r, Ok(o) if o.status == ActionStatus::Success))
        .count();
    assert_eq!(refused, 1);
    assert_eq!(finished, 1);

    // Lease released: the next run goes through
    h.client.set_bulk_latency(Duration::ZERO);
    assert!(h
        .manager
        .update("numbers", None, UpdateMode::Resume, None)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_stalled_detection_sees_no_finished_runs() {
    let h = harness(10, 5, 1).await;
    h.manager
        .update("numbers", None, UpdateMode::Full, None)
        .await
        .unwrap();

    let later = Utc::now() + chrono::Duration::hours(1);
    assert!(h.manager.ledger().stalled(later).await.unwrap().is_empty());
}
