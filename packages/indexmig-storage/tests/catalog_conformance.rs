//! Behaviour every `CatalogStore` adapter must share
//!
//! Each scenario runs against the in-memory catalog and the SQLite catalog.

use chrono::Utc;
use indexmig_storage::{
    ActionKind, ActionStatus, CatalogStore, IndexAction, InMemoryCatalog, NewVersion, VersionKey,
    VersionState,
};
use std::sync::Arc;

fn adapters() -> Vec<(&'static str, Arc<dyn CatalogStore>)> {
    let mut stores: Vec<(&'static str, Arc<dyn CatalogStore>)> =
        vec![("memory", Arc::new(InMemoryCatalog::new()))];
    #[cfg(feature = "sqlite")]
    stores.push((
        "sqlite",
        Arc::new(indexmig_storage::SqliteCatalog::in_memory().unwrap()),
    ));
    stores
}

fn new_version(index: &str, fingerprint: &str) -> NewVersion {
    NewVersion::new(index, "ci_", fingerprint, serde_json::json!({}), "v2.3.1")
}

#[tokio::test]
async fn test_active_pointer_single_valued() {
    for (name, store) in adapters() {
        for fingerprint in ["a", "b", "c"] {
            store.allocate_version(new_version("movies", fingerprint)).await.unwrap();
        }

        for seq in [1, 3, 2, 3] {
            store.set_active_version("movies", "ci_", Some(seq)).await.unwrap();
            let index = store.get_index("movies").await.unwrap().unwrap();
            assert_eq!(index.active_version("ci_"), Some(seq), "adapter {}", name);
            assert_eq!(index.active.len(), 1, "adapter {}", name);
        }

        let previous = store.set_active_version("movies", "ci_", None).await.unwrap();
        assert_eq!(previous, Some(3), "adapter {}", name);
    }
}

#[tokio::test]
async fn test_environments_share_sequence_not_pointer() {
    for (name, store) in adapters() {
        let ci = store.allocate_version(new_version("movies", "a")).await.unwrap();
        let prod = store
            .allocate_version(NewVersion::new("movies", "prod_", "a", serde_json::json!({}), "v1"))
            .await
            .unwrap();
        assert_eq!(ci.key.sequence, 1, "adapter {}", name);
        assert_eq!(prod.key.sequence, 2, "adapter {}", name);

        store.set_active_version("movies", "ci_", Some(1)).await.unwrap();
        store.set_active_version("movies", "prod_", Some(2)).await.unwrap();

        // Dropping the ci_ version leaves prod_ active
        store.mark_dropped(&ci.key, Utc::now()).await.unwrap();
        let index = store.get_index("movies").await.unwrap().unwrap();
        assert_eq!(index.active_version("ci_"), None, "adapter {}", name);
        assert_eq!(index.active_version("prod_"), Some(2), "adapter {}", name);

        store.purge_environment("ci_").await.unwrap();
        let remaining = store.list_versions("movies").await.unwrap();
        assert_eq!(remaining.len(), 1, "adapter {}", name);
        assert_eq!(remaining[0].remote_name(), "prod_movies-2", "adapter {}", name);
    }
}

#[tokio::test]
async fn test_hard_delete_keeps_dangling_action() {
    for (name, store) in adapters() {
        let version = store.allocate_version(new_version("movies", "a")).await.unwrap();
        let action = IndexAction::new(
            ActionKind::Create,
            Some("movies".into()),
            Some(version.key.clone()),
            "initial",
        );
        store.insert_action(&action).await.unwrap();

        store.mark_dropped(&version.key, Utc::now()).await.unwrap();
        store.delete_version(&version.key).await.unwrap();

        assert!(store.get_version(&version.key).await.unwrap().is_none(), "adapter {}", name);
        let stored = store.get_action(action.id).await.unwrap();
        assert_eq!(stored.version, Some(VersionKey::new("movies", 1)), "adapter {}", name);
    }
}

#[tokio::test]
async fn test_versions_listed_in_sequence_order() {
    for (name, store) in adapters() {
        for fingerprint in ["a", "b", "c", "d"] {
            store.allocate_version(new_version("movies", fingerprint)).await.unwrap();
        }
        store.allocate_version(new_version("books", "x")).await.unwrap();
        store
            .mark_dropped(&VersionKey::new("movies", 2), Utc::now())
            .await
            .unwrap();

        let versions = store.list_versions("movies").await.unwrap();
        let sequences: Vec<u32> = versions.iter().map(|v| v.key.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4], "adapter {}", name);
        assert_eq!(versions[1].state, VersionState::Dropped, "adapter {}", name);

        let names: Vec<String> = store
            .list_indexes()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["books".to_string(), "movies".to_string()], "adapter {}", name);
    }
}

#[tokio::test]
async fn test_heartbeat_then_complete() {
    for (name, store) in adapters() {
        let mut action = IndexAction::new(ActionKind::Update, Some("movies".into()), None, "cron");
        store.insert_action(&action).await.unwrap();

        action.heartbeat_at = Utc::now();
        action.docs_affected = 500;
        store.update_action(&action).await.unwrap();

        action.status = ActionStatus::Partial;
        action.finished_at = Some(Utc::now());
        store.update_action(&action).await.unwrap();

        let stored = store.get_action(action.id).await.unwrap();
        assert_eq!(stored.status, ActionStatus::Partial, "adapter {}", name);
        assert_eq!(stored.docs_affected, 500, "adapter {}", name);
        assert!(store.in_progress_actions().await.unwrap().is_empty(), "adapter {}", name);
    }
}
