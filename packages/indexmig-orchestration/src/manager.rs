//! Index manager
//!
//! The operation surface callers (a CLI, a scheduler, a deploy hook) use.
//! It owns the wiring: catalog, remote client, config, the registry of
//! document producers, and the state machine and engine built on them.
//! Names accept either a base name (`movies`) or a version name
//! (`movies-3`, with or without the environment prefix).
//!
//! Everything a manager reads or writes is scoped to its environment prefix:
//! managers of several environments can share one catalog and one remote
//! cluster without seeing each other's versions or pointers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmig_storage::{
    ActionKind, ActionStatus, CatalogStore, IndexVersion, VersionKey, VersionState,
};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::{OrchestratorError, Result};
use crate::ledger::{ActionHandle, ActionLedger};
use crate::lease::UpdateLeases;
use crate::naming::{IndexNamer, Resolved};
use crate::producer::DocumentProducer;
use crate::reindex::{ReindexEngine, UpdateMode, UpdateOptions, UpdateReport};
use crate::remote::RemoteIndexClient;
use crate::versions::{Confirmation, ResetScope, TransitionOutcome, VersionStateMachine};

/// What a mutating operation did
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub action_id: Uuid,
    pub status: ActionStatus,
    pub version: Option<VersionKey>,
    pub noop: bool,
    /// Counts of an update run
    pub report: Option<UpdateReport>,
    /// Sub-operations of a fan-out (`update_newer`, `clear_older`, ...)
    pub children: Vec<OperationOutcome>,
}

impl From<TransitionOutcome> for OperationOutcome {
    fn from(outcome: TransitionOutcome) -> Self {
        Self {
            action_id: outcome.action.id,
            status: outcome.action.status,
            version: outcome
                .version
                .map(|v| v.key)
                .or(outcome.action.version),
            noop: outcome.noop,
            report: None,
            children: Vec::new(),
        }
    }
}

impl From<UpdateReport> for OperationOutcome {
    fn from(report: UpdateReport) -> Self {
        Self {
            action_id: report.action_id,
            status: report.status,
            version: Some(report.version.clone()),
            noop: false,
            report: Some(report),
            children: Vec::new(),
        }
    }
}

/// One line of `list()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingRow {
    pub index: String,
    /// None for a registered index that has no version yet
    pub remote_name: Option<String>,
    pub sequence: Option<u32>,
    pub state: Option<VersionState>,
    pub active: bool,
    pub tag: Option<String>,
    pub doc_count: u64,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub last_attempted_update: Option<DateTime<Utc>>,
    /// Whether the version matches the registered producer's current schema
    pub schema_current: Option<bool>,
}

impl ListingRow {
    fn not_created(index: &str) -> Self {
        Self {
            index: index.to_string(),
            remote_name: None,
            sequence: None,
            state: None,
            active: false,
            tag: None,
            doc_count: 0,
            last_successful_update: None,
            last_attempted_update: None,
            schema_current: None,
        }
    }

    fn for_version(version: &IndexVersion, active: bool, current: Option<&str>) -> Self {
        Self {
            index: version.key.index.clone(),
            remote_name: Some(version.remote_name()),
            sequence: Some(version.key.sequence),
            state: Some(version.state),
            active,
            tag: Some(version.tag.clone()),
            doc_count: version.doc_count,
            last_successful_update: version.last_successful_update,
            last_attempted_update: version.last_attempted_update,
            schema_current: current.map(|fp| fp == version.fingerprint),
        }
    }

    pub fn is_created(&self) -> bool {
        self.sequence.is_some()
    }
}

/// Caller input resolved to an index and, when named, an exact version
struct Target {
    index: String,
    key: Option<VersionKey>,
    resolved: Option<Resolved>,
}

impl Target {
    /// The named version, or the active one for a bare base name
    fn exact_or_active(&self) -> Result<VersionKey> {
        if let Some(key) = &self.key {
            return Ok(key.clone());
        }
        match &self.resolved {
            Some(resolved) => Ok(resolved.require_active()?.key.clone()),
            None => Err(OrchestratorError::NoActiveVersion(self.index.clone())),
        }
    }

    fn active_sequence(&self, prefix: &str) -> Result<u32> {
        self.resolved
            .as_ref()
            .and_then(|r| r.index.active_version(prefix))
            .ok_or_else(|| OrchestratorError::NoActiveVersion(self.index.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relative {
    Older,
    Newer,
}

pub struct IndexManager {
    store: Arc<dyn CatalogStore>,
    config: ManagerConfig,
    namer: IndexNamer,
    ledger: Arc<ActionLedger>,
    versions: VersionStateMachine,
    engine: ReindexEngine,
    producers: RwLock<BTreeMap<String, Arc<dyn DocumentProducer>>>,
    context: String,
}

impl IndexManager {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        client: Arc<dyn RemoteIndexClient>,
        config: ManagerConfig,
    ) -> Self {
        let namer = IndexNamer::new(config.environment_prefix.clone());
        let ledger = Arc::new(
            ActionLedger::new(store.clone(), config.stall_after())
                .in_environment(config.environment_prefix.clone()),
        );
        let versions = VersionStateMachine::new(
            store.clone(),
            client.clone(),
            ledger.clone(),
            namer.clone(),
            config.codebase_id.clone(),
        );
        let engine = ReindexEngine::new(
            store.clone(),
            client,
            ledger.clone(),
            UpdateLeases::new(),
        );

        info!(
            "Index manager ready (prefix '{}', codebase '{}')",
            config.environment_prefix, config.codebase_id
        );
        Self {
            store,
            config,
            namer,
            ledger,
            versions,
            engine,
            producers: RwLock::new(BTreeMap::new()),
            context: String::new(),
        }
    }

    /// Context string stored on every action this manager opens
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn namer(&self) -> &IndexNamer {
        &self.namer
    }

    pub fn ledger(&self) -> &ActionLedger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Declare an index and the producer of its documents
    pub fn register(&self, name: impl Into<String>, producer: Arc<dyn DocumentProducer>) {
        let name = name.into();
        if self.producers.write().insert(name.clone(), producer).is_some() {
            warn!("Producer for {} replaced", name);
        }
    }

    pub fn registered(&self) -> Vec<String> {
        self.producers.read().keys().cloned().collect()
    }

    fn producer(&self, index: &str) -> Result<Arc<dyn DocumentProducer>> {
        self.producers
            .read()
            .get(index)
            .cloned()
            .ok_or_else(|| OrchestratorError::ProducerNotRegistered(index.to_string()))
    }

    async fn target(&self, name: &str, version: Option<u32>) -> Result<Target> {
        match self.namer.resolve(self.store.as_ref(), name).await {
            Ok(resolved) => {
                let index = resolved.index.name.clone();
                let key = match (version, resolved.exact) {
                    (Some(seq), true) => {
                        let named = resolved.version.as_ref().map(|v| v.key.sequence);
                        if named != Some(seq) {
                            return Err(OrchestratorError::NameResolution(format!(
                                "{} does not name version {}",
                                name, seq
                            )));
                        }
                        Some(VersionKey::new(&index, seq))
                    }
                    (Some(seq), false) => {
                        let key = VersionKey::new(&index, seq);
                        let owned = self
                            .store
                            .get_version(&key)
                            .await?
                            .map_or(false, |v| self.namer.owns(&v));
                        if !owned {
                            return Err(OrchestratorError::NameResolution(
                                self.namer.remote_name(&index, seq),
                            ));
                        }
                        Some(key)
                    }
                    (None, true) => resolved.version.as_ref().map(|v| v.key.clone()),
                    (None, false) => None,
                };
                Ok(Target {
                    index,
                    key,
                    resolved: Some(resolved),
                })
            }
            // Registered but never created: known name, no catalog row yet
            Err(OrchestratorError::NameResolution(_)) if self.producers.read().contains_key(name) => {
                Ok(Target {
                    index: name.to_string(),
                    key: version.map(|seq| VersionKey::new(name, seq)),
                    resolved: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Listing
    // ═══════════════════════════════════════════════════════════════════════

    /// One row per available version of this environment, plus a row per
    /// registered index that has none
    ///
    /// Catalog indexes that only other environments use are left out.
    pub async fn list(&self) -> Result<Vec<ListingRow>> {
        let current: BTreeMap<String, String> = self
            .producers
            .read()
            .iter()
            .map(|(name, producer)| (name.clone(), producer.schema().fingerprint()))
            .collect();

        let mut names: Vec<String> = current.keys().cloned().collect();
        for index in self.store.list_indexes().await? {
            if !names.contains(&index.name) {
                names.push(index.name);
            }
        }
        names.sort();

        let prefix = self.namer.prefix();
        let mut rows = Vec::new();
        for name in names {
            let owned = self.versions.environment_versions(&name).await?;
            if owned.is_empty() && !current.contains_key(&name) {
                continue;
            }
            let active = self
                .store
                .get_index(&name)
                .await?
                .and_then(|index| index.active_version(prefix));
            let versions: Vec<IndexVersion> = owned
                .into_iter()
                .filter(IndexVersion::is_available)
                .collect();

            if versions.is_empty() {
                rows.push(ListingRow::not_created(&name));
                continue;
            }
            for version in &versions {
                rows.push(ListingRow::for_version(
                    version,
                    active == Some(version.key.sequence),
                    current.get(&name).map(String::as_str),
                ));
            }
        }
        Ok(rows)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Single-version operations
    // ═══════════════════════════════════════════════════════════════════════

    /// New version from the registered producer's schema (no-op when unchanged)
    pub async fn create_version(&self, name: &str, force: bool) -> Result<OperationOutcome> {
        let producer = self.producer(name)?;
        let outcome = self
            .versions
            .create_version(name, &producer.schema(), force, &self.context)
            .await?;
        Ok(outcome.into())
    }

    /// Activate a version; the newest built one when none is named
    pub async fn activate(&self, name: &str, version: Option<u32>) -> Result<OperationOutcome> {
        let target = self.target(name, version).await?;
        if target.resolved.is_none() {
            return Err(OrchestratorError::NoCreatedVersion(target.index));
        }
        let outcome = self
            .versions
            .activate_version(
                &target.index,
                target.key.map(|k| k.sequence),
                &self.context,
            )
            .await?;
        Ok(outcome.into())
    }

    pub async fn deactivate(&self, name: &str) -> Result<OperationOutcome> {
        let target = self.target(name, None).await?;
        if target.resolved.is_none() {
            return Err(OrchestratorError::NoCreatedVersion(target.index));
        }
        let outcome = self
            .versions
            .deactivate(
                &target.index,
                target.key.map(|k| k.sequence),
                &self.context,
            )
            .await?;
        Ok(outcome.into())
    }

    /// Reindex a version (the active one by default)
    ///
    /// `concurrency` overrides the configured worker count.
    pub async fn update(
        &self,
        name: &str,
        version: Option<u32>,
        mode: UpdateMode,
        concurrency: Option<usize>,
    ) -> Result<OperationOutcome> {
        let mut options = UpdateOptions::from_config(&self.config);
        if let Some(workers) = concurrency {
            options = options.with_workers(workers);
        }
        self.update_with(name, version, mode, &options).await
    }

    /// `update` with explicit options (cancellation token, batch size)
    pub async fn update_with(
        &self,
        name: &str,
        version: Option<u32>,
        mode: UpdateMode,
        options: &UpdateOptions,
    ) -> Result<OperationOutcome> {
        let target = self.target(name, version).await?;
        let key = target.exact_or_active()?;
        let producer = self.producer(&key.index)?;
        let report = self
            .engine
            .update(&key, producer, mode, options, &self.context)
            .await?;
        Ok(report.into())
    }

    /// Remove all documents of a version (the active one by default)
    pub async fn clear(&self, name: &str, version: Option<u32>) -> Result<OperationOutcome> {
        let target = self.target(name, version).await?;
        let key = target.exact_or_active()?;
        let outcome = self.versions.clear_version(&key, &self.context).await?;
        Ok(outcome.into())
    }

    /// Drop one version; a base name alone is refused
    pub async fn drop(
        &self,
        name: &str,
        version: Option<u32>,
        hard_delete: bool,
    ) -> Result<OperationOutcome> {
        let target = self.target(name, version).await?;
        let key = target
            .key
            .ok_or_else(|| OrchestratorError::IndexVersionRequired(name.to_string()))?;
        let outcome = self
            .versions
            .drop_version(&key, hard_delete, &self.context)
            .await?;
        Ok(outcome.into())
    }

    pub async fn reset(
        &self,
        scope: ResetScope,
        confirmation: Confirmation,
    ) -> Result<OperationOutcome> {
        let outcome = self
            .versions
            .reset_all(scope, confirmation, &self.context)
            .await?;
        Ok(outcome.into())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fan-out operations
    // ═══════════════════════════════════════════════════════════════════════

    async fn relative_versions(
        &self,
        target: &Target,
        relative: Relative,
    ) -> Result<Vec<IndexVersion>> {
        let active = target.active_sequence(self.namer.prefix())?;
        Ok(self
            .versions
            .environment_versions(&target.index)
            .await?
            .into_iter()
            .filter(|v| !v.is_dropped())
            .filter(|v| match relative {
                Relative::Older => v.key.sequence < active,
                Relative::Newer => v.key.sequence > active,
            })
            .collect())
    }

    /// Update every built version newer than the active one
    pub async fn update_newer(&self, name: &str, mode: UpdateMode) -> Result<OperationOutcome> {
        let target = self.target(name, None).await?;
        let newer: Vec<IndexVersion> = self
            .relative_versions(&target, Relative::Newer)
            .await?
            .into_iter()
            .filter(IndexVersion::is_built)
            .collect();
        let producer = self.producer(&target.index)?;
        let options = UpdateOptions::from_config(&self.config);

        let mut parent = self
            .ledger
            .record(ActionKind::Update, target.index.as_str(), &self.context)
            .await?;
        parent.log(format!(
            "Updating {} versions of {} newer than the active one",
            newer.len(),
            target.index
        ));

        let mut children = Vec::new();
        for version in &newer {
            let result = self
                .engine
                .update(&version.key, producer.clone(), mode, &options, &parent)
                .await
                .map(OperationOutcome::from);
            children.push(self.settle_child(&mut parent, &version.key, result));
        }
        self.finish_fan_out(parent, children).await
    }

    /// Clear every built version older than the active one
    pub async fn clear_older(&self, name: &str) -> Result<OperationOutcome> {
        let target = self.target(name, None).await?;
        let older: Vec<IndexVersion> = self
            .relative_versions(&target, Relative::Older)
            .await?
            .into_iter()
            .filter(IndexVersion::is_built)
            .collect();

        let mut parent = self
            .ledger
            .record(ActionKind::Clear, target.index.as_str(), &self.context)
            .await?;
        parent.log(format!(
            "Clearing {} versions of {} older than the active one",
            older.len(),
            target.index
        ));

        let mut children = Vec::new();
        for version in &older {
            let result = self
                .versions
                .clear_version(&version.key, &parent)
                .await
                .map(OperationOutcome::from);
            children.push(self.settle_child(&mut parent, &version.key, result));
        }
        self.finish_fan_out(parent, children).await
    }

    /// Drop every version older than the active one
    pub async fn drop_older(&self, name: &str, hard_delete: bool) -> Result<OperationOutcome> {
        let target = self.target(name, None).await?;
        let older = self.relative_versions(&target, Relative::Older).await?;

        let mut parent = self
            .ledger
            .record(ActionKind::Drop, target.index.as_str(), &self.context)
            .await?;
        parent.log(format!(
            "Dropping {} versions of {} older than the active one",
            older.len(),
            target.index
        ));

        let mut children = Vec::new();
        for version in &older {
            let result = self
                .versions
                .drop_version(&version.key, hard_delete, &parent)
                .await
                .map(OperationOutcome::from);
            children.push(self.settle_child(&mut parent, &version.key, result));
        }
        self.finish_fan_out(parent, children).await
    }

    /// Child errors are logged on the parent; the fan-out goes on
    fn settle_child(
        &self,
        parent: &mut ActionHandle,
        key: &VersionKey,
        result: Result<OperationOutcome>,
    ) -> Option<OperationOutcome> {
        match result {
            Ok(outcome) => {
                parent.log(format!("{}: {}", key, outcome.status));
                Some(outcome)
            }
            Err(e) => {
                parent.warn(format!("{}: {}", key, e));
                None
            }
        }
    }

    async fn finish_fan_out(
        &self,
        parent: ActionHandle,
        children: Vec<Option<OperationOutcome>>,
    ) -> Result<OperationOutcome> {
        let total = children.len();
        let settled: Vec<OperationOutcome> = children.into_iter().flatten().collect();
        let succeeded = settled
            .iter()
            .filter(|c| c.status == ActionStatus::Success)
            .count();

        let status = if succeeded == total {
            ActionStatus::Success
        } else if succeeded > 0 {
            ActionStatus::Partial
        } else {
            ActionStatus::Failed
        };
        let versions: Vec<String> = settled
            .iter()
            .filter_map(|c| c.version.as_ref().map(ToString::to_string))
            .collect();

        let action = self
            .ledger
            .complete(
                parent,
                status,
                json!({
                    "total": total,
                    "succeeded": succeeded,
                    "versions": versions,
                }),
            )
            .await?;
        Ok(OperationOutcome {
            action_id: action.id,
            status,
            version: None,
            noop: total == 0,
            report: None,
            children: settled,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Bootstrap
    // ═══════════════════════════════════════════════════════════════════════

    /// Create and activate a version for every registered index without an
    /// active version
    pub async fn create_and_activate_all(&self) -> Result<Vec<OperationOutcome>> {
        let mut outcomes = Vec::new();
        for name in self.registered() {
            let has_active = self
                .store
                .get_index(&name)
                .await?
                .and_then(|index| index.active_version(self.namer.prefix()))
                .is_some();
            if has_active {
                continue;
            }

            info!("Bootstrapping index {}", name);
            let created = self.create_version(&name, false).await?;
            let sequence = created.version.as_ref().map(|k| k.sequence);
            outcomes.push(created);
            outcomes.push(self.activate(&name, sequence).await?);
        }
        Ok(outcomes)
    }
}
