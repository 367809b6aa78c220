//! In-memory catalog
//!
//! All three tables sit behind one lock, so every multi-row change
//! (sequence bump + insert, pointer flip, drop + pointer clear, environment
//! purge) is applied under a single write guard and no reader can observe
//! half of it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::{
    CatalogStore, Index, IndexAction, IndexVersion, NewVersion, VersionKey, VersionState,
};
use crate::{Result, StorageError};

#[derive(Default)]
struct CatalogState {
    indexes: BTreeMap<String, Index>,
    versions: BTreeMap<VersionKey, IndexVersion>,
    actions: HashMap<Uuid, IndexAction>,
}

/// Process-local `CatalogStore`
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    state: Arc<RwLock<CatalogState>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn checked_transition(stored: &IndexVersion, to: VersionState) -> Result<()> {
    if stored.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(StorageError::invalid_transition(
            &stored.key,
            stored.state,
            to,
        ))
    }
}

fn sorted_by_start(mut actions: Vec<IndexAction>) -> Vec<IndexAction> {
    actions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    actions
}

#[async_trait]
impl CatalogStore for InMemoryCatalog {
    async fn get_or_create_index(&self, name: &str) -> Result<Index> {
        let mut state = self.state.write();
        let index = state
            .indexes
            .entry(name.to_string())
            .or_insert_with(|| Index::new(name));
        Ok(index.clone())
    }

    async fn get_index(&self, name: &str) -> Result<Option<Index>> {
        Ok(self.state.read().indexes.get(name).cloned())
    }

    async fn list_indexes(&self) -> Result<Vec<Index>> {
        Ok(self.state.read().indexes.values().cloned().collect())
    }

    async fn allocate_version(&self, new: NewVersion) -> Result<IndexVersion> {
        let mut state = self.state.write();
        let index = state
            .indexes
            .entry(new.index.clone())
            .or_insert_with(|| Index::new(new.index.clone()));
        index.last_sequence += 1;
        let version = new.into_version(index.last_sequence);
        state.versions.insert(version.key.clone(), version.clone());
        Ok(version)
    }

    async fn get_version(&self, key: &VersionKey) -> Result<Option<IndexVersion>> {
        Ok(self.state.read().versions.get(key).cloned())
    }

    async fn list_versions(&self, index: &str) -> Result<Vec<IndexVersion>> {
        Ok(self
            .state
            .read()
            .versions
            .values()
            .filter(|v| v.key.index == index)
            .cloned()
            .collect())
    }

    async fn update_version(&self, version: &IndexVersion) -> Result<()> {
        let mut state = self.state.write();
        match state.versions.get_mut(&version.key) {
            Some(stored) => {
                checked_transition(stored, version.state)?;
                *stored = version.clone();
                Ok(())
            }
            None => Err(StorageError::version_not_found(&version.key)),
        }
    }

    async fn set_active_version(
        &self,
        index: &str,
        prefix: &str,
        sequence: Option<u32>,
    ) -> Result<Option<u32>> {
        let mut state = self.state.write();
        if let Some(seq) = sequence {
            let key = VersionKey::new(index, seq);
            let in_environment = state
                .versions
                .get(&key)
                .map_or(false, |v| v.prefix == prefix);
            if !in_environment {
                return Err(StorageError::version_not_found(format!("{}{}", prefix, key)));
            }
        }
        let entry = state
            .indexes
            .get_mut(index)
            .ok_or_else(|| StorageError::index_not_found(index))?;
        let previous = match sequence {
            Some(seq) => entry.active.insert(prefix.to_string(), seq),
            None => entry.active.remove(prefix),
        };
        Ok(previous)
    }

    async fn mark_dropped(&self, key: &VersionKey, at: DateTime<Utc>) -> Result<IndexVersion> {
        let mut state = self.state.write();
        let version = state
            .versions
            .get_mut(key)
            .ok_or_else(|| StorageError::version_not_found(key))?;
        // Dropped -> Dropped would move deleted_at
        if version.is_dropped() {
            return Err(StorageError::invalid_transition(
                key,
                version.state,
                VersionState::Dropped,
            ));
        }
        version.state = VersionState::Dropped;
        version.deleted_at = Some(at);
        let dropped = version.clone();

        if let Some(index) = state.indexes.get_mut(&key.index) {
            index.release_pointer(key.sequence);
        }
        Ok(dropped)
    }

    async fn delete_version(&self, key: &VersionKey) -> Result<()> {
        let mut state = self.state.write();
        state
            .versions
            .remove(key)
            .ok_or_else(|| StorageError::version_not_found(key))?;
        if let Some(index) = state.indexes.get_mut(&key.index) {
            index.release_pointer(key.sequence);
        }
        Ok(())
    }

    async fn insert_action(&self, action: &IndexAction) -> Result<()> {
        self.state.write().actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn update_action(&self, action: &IndexAction) -> Result<()> {
        let mut state = self.state.write();
        let stored = state
            .actions
            .get_mut(&action.id)
            .ok_or_else(|| StorageError::action_not_found(action.id))?;
        if stored.is_terminal() {
            return Err(StorageError::action_finalized(action.id, stored.status));
        }
        *stored = action.clone();
        Ok(())
    }

    async fn get_action(&self, id: Uuid) -> Result<IndexAction> {
        self.state
            .read()
            .actions
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::action_not_found(id))
    }

    async fn latest_action_for(
        &self,
        index: &str,
        version: Option<&VersionKey>,
    ) -> Result<Option<IndexAction>> {
        Ok(self
            .state
            .read()
            .actions
            .values()
            .filter(|a| a.targets(index, version))
            .max_by_key(|a| a.started_at)
            .cloned())
    }

    async fn actions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IndexAction>> {
        let actions = self
            .state
            .read()
            .actions
            .values()
            .filter(|a| a.started_at >= from && a.started_at <= to)
            .cloned()
            .collect();
        Ok(sorted_by_start(actions))
    }

    async fn in_progress_actions(&self) -> Result<Vec<IndexAction>> {
        let actions = self
            .state
            .read()
            .actions
            .values()
            .filter(|a| !a.is_terminal())
            .cloned()
            .collect();
        Ok(sorted_by_start(actions))
    }

    async fn purge_environment(&self, prefix: &str) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.actions.retain(|_, a| a.environment != prefix);
        state.versions.retain(|_, v| v.prefix != prefix);

        let versions = &state.versions;
        state.indexes.retain(|name, index| {
            index.active.remove(prefix);
            versions.keys().any(|key| &key.index == name)
        });
        Ok(())
    }
}
