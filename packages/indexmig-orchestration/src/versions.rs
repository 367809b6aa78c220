//! Version state machine
//!
//! Per index: `NO_VERSION → HAS_VERSION(S)`. Per version:
//!
//! ```text
//! DECLARED ──► BUILT ──► PENDING_DROP ──► DROPPED ──► (row deleted)
//!                │
//!                └── active / inactive is the index pointer, not a state
//! ```
//!
//! Every state write goes through [`VersionState::can_transition_to`]; an
//! illegal move is refused with `InvalidStateTransition` before anything is
//! written. All lookups are scoped to this environment's prefix, so managers
//! of several environments can share one catalog.
//!
//! Preconditions (unknown names, unbuilt targets) are checked before an
//! action is opened. Once an action is open, remote failures complete it as
//! `Failed` and leave the catalog in a state the same call can retry from.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmig_storage::{
    ActionKind, ActionStatus, CatalogStore, IndexAction, IndexVersion, NewVersion, VersionKey,
    VersionState,
};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::fingerprint::IndexSchema;
use crate::ledger::{ActionLedger, ActionOrigin, ActionTarget};
use crate::naming::IndexNamer;
use crate::remote::RemoteIndexClient;

/// What `reset_all` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Drop remote indexes, keep catalog rows (marked dropped)
    RemoteOnly,
    /// Drop remote indexes, then recreate every available version from the
    /// schema stored in its catalog row; pointers are kept
    RebuildRemote,
    /// Drop remote indexes and purge every catalog row
    Everything,
}

/// Explicit opt-in for destructive operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Confirmation {
    #[default]
    Unconfirmed,
    Confirmed,
}

/// Result of one transition
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub action: IndexAction,
    /// Version after the transition (None for reset and deactivate)
    pub version: Option<IndexVersion>,
    /// Nothing needed to change
    pub noop: bool,
}

pub struct VersionStateMachine {
    store: Arc<dyn CatalogStore>,
    client: Arc<dyn RemoteIndexClient>,
    ledger: Arc<ActionLedger>,
    namer: IndexNamer,
    codebase_id: String,
}

impl VersionStateMachine {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        client: Arc<dyn RemoteIndexClient>,
        ledger: Arc<ActionLedger>,
        namer: IndexNamer,
        codebase_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            client,
            ledger,
            namer,
            codebase_id: codebase_id.into(),
        }
    }

    /// Versions of `index` created under this environment's prefix
    pub async fn environment_versions(&self, index: &str) -> Result<Vec<IndexVersion>> {
        Ok(self
            .store
            .list_versions(index)
            .await?
            .into_iter()
            .filter(|v| self.namer.owns(v))
            .collect())
    }

    /// Highest-sequence version that is neither dropped nor pending drop
    pub async fn latest_available(&self, index: &str) -> Result<Option<IndexVersion>> {
        Ok(self
            .environment_versions(index)
            .await?
            .into_iter()
            .filter(IndexVersion::is_available)
            .max_by_key(|v| v.key.sequence))
    }

    /// Highest-sequence built version
    pub async fn latest_built(&self, index: &str) -> Result<Option<IndexVersion>> {
        Ok(self
            .environment_versions(index)
            .await?
            .into_iter()
            .filter(IndexVersion::is_built)
            .max_by_key(|v| v.key.sequence))
    }

    async fn load_version(&self, key: &VersionKey) -> Result<IndexVersion> {
        self.store
            .get_version(key)
            .await?
            .filter(|v| self.namer.owns(v))
            .ok_or_else(|| OrchestratorError::NameResolution(key.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Create
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a version for `schema` unless the latest one already matches
    ///
    /// - same fingerprint, `Built`, not forced: no-op action, no remote call
    /// - same fingerprint, still `Declared`: retry the remote create for it
    /// - otherwise: allocate the next sequence and create remotely
    pub async fn create_version<'o>(
        &self,
        index: &str,
        schema: &IndexSchema,
        force_new: bool,
        origin: impl Into<ActionOrigin<'o>>,
    ) -> Result<TransitionOutcome> {
        let origin: ActionOrigin<'_> = origin.into();
        let fingerprint = schema.fingerprint();
        let latest = self.latest_available(index).await?;

        let reusable = latest.filter(|v| !force_new && v.fingerprint == fingerprint);
        let (mut version, retrying) = match reusable {
            Some(existing) if existing.is_built() => {
                let mut handle = self
                    .ledger
                    .open(ActionKind::Create, existing.key.clone(), origin)
                    .await?;
                handle.log(format!(
                    "Schema of {} unchanged since {}; no new version created",
                    index,
                    existing.remote_name()
                ));
                let action = self
                    .ledger
                    .complete(handle, ActionStatus::Success, json!({ "noop": true }))
                    .await?;
                return Ok(TransitionOutcome {
                    action,
                    version: Some(existing),
                    noop: true,
                });
            }
            Some(declared) => (declared, true),
            None => {
                let allocated = self
                    .store
                    .allocate_version(NewVersion::new(
                        index,
                        self.namer.prefix(),
                        fingerprint.clone(),
                        schema.as_json().clone(),
                        self.codebase_id.clone(),
                    ))
                    .await?;
                (allocated, false)
            }
        };

        let remote_name = version.remote_name();
        let mut handle = self
            .ledger
            .open(ActionKind::Create, version.key.clone(), origin)
            .await?;
        if retrying {
            handle.log(format!("Retrying remote create of declared version {}", remote_name));
        }

        match self.client.create_remote_index(&remote_name, schema).await {
            Ok(()) => handle.log(format!("Created remote index {}", remote_name)),
            Err(e) if e.is_already_exists() => {
                handle.log(format!("Remote index {} already exists", remote_name))
            }
            Err(e) => {
                let err = OrchestratorError::RemoteIndexCreate {
                    name: remote_name,
                    reason: e.to_string(),
                };
                self.ledger.fail(handle, &err).await?;
                return Err(err);
            }
        }

        if let Err(err) = advance(&mut version, VersionState::Built) {
            self.ledger.fail(handle, &err).await?;
            return Err(err);
        }
        self.store.update_version(&version).await?;
        info!(
            "Index version {} built (fingerprint {})",
            remote_name,
            &fingerprint[..12]
        );

        let action = self
            .ledger
            .complete(
                handle,
                ActionStatus::Success,
                json!({
                    "noop": false,
                    "remote_name": remote_name,
                    "fingerprint": fingerprint,
                    "retried": retrying,
                }),
            )
            .await?;
        Ok(TransitionOutcome {
            action,
            version: Some(version),
            noop: false,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Activate / Deactivate
    // ═══════════════════════════════════════════════════════════════════════

    /// Point `index` at `sequence`, or at the newest built version
    pub async fn activate_version<'o>(
        &self,
        index: &str,
        sequence: Option<u32>,
        origin: impl Into<ActionOrigin<'o>>,
    ) -> Result<TransitionOutcome> {
        let origin: ActionOrigin<'_> = origin.into();
        if self.store.get_index(index).await?.is_none() {
            return Err(OrchestratorError::NameResolution(index.to_string()));
        }

        let target = match sequence {
            Some(seq) => self.load_version(&VersionKey::new(index, seq)).await?,
            None => self
                .latest_built(index)
                .await?
                .ok_or_else(|| OrchestratorError::NoCreatedVersion(index.to_string()))?,
        };
        if !target.is_built() {
            return Err(OrchestratorError::VersionNotBuilt(target.key.to_string()));
        }

        let mut handle = self
            .ledger
            .open(ActionKind::Activate, target.key.clone(), origin)
            .await?;
        let previous = self
            .store
            .set_active_version(index, self.namer.prefix(), Some(target.key.sequence))
            .await?;

        let noop = previous == Some(target.key.sequence);
        match (noop, previous) {
            (true, _) => handle.log(format!("{} was already active", target.remote_name())),
            (false, Some(prior)) => handle.log(format!(
                "Activated {}, deactivated {}",
                target.remote_name(),
                self.namer.remote_name(index, prior)
            )),
            (false, None) => handle.log(format!("Activated {}", target.remote_name())),
        }

        let action = self
            .ledger
            .complete(
                handle,
                ActionStatus::Success,
                json!({ "previous": previous, "noop": noop }),
            )
            .await?;
        Ok(TransitionOutcome {
            action,
            version: Some(target),
            noop,
        })
    }

    /// Clear the active pointer of `index`
    ///
    /// With `sequence`, only deactivates when that version is the active one;
    /// otherwise the call is a logged no-op.
    pub async fn deactivate<'o>(
        &self,
        index: &str,
        sequence: Option<u32>,
        origin: impl Into<ActionOrigin<'o>>,
    ) -> Result<TransitionOutcome> {
        let origin: ActionOrigin<'_> = origin.into();
        let entry = self
            .store
            .get_index(index)
            .await?
            .ok_or_else(|| OrchestratorError::NameResolution(index.to_string()))?;

        let prefix = self.namer.prefix();
        let active = entry.active_version(prefix);
        let target: ActionTarget = match (sequence, entry.active_key(prefix)) {
            (Some(seq), _) => VersionKey::new(index, seq).into(),
            (None, Some(key)) => key.into(),
            (None, None) => index.into(),
        };
        let mut handle = self
            .ledger
            .open(ActionKind::Deactivate, target, origin)
            .await?;

        let matches_request = sequence.map_or(true, |seq| active == Some(seq));
        let previous = if active.is_some() && matches_request {
            self.store.set_active_version(index, prefix, None).await?
        } else {
            None
        };

        let noop = previous.is_none();
        match (previous, sequence) {
            (Some(seq), _) => handle.log(format!(
                "Deactivated {}; {} has no active version",
                self.namer.remote_name(index, seq),
                index
            )),
            (None, Some(seq)) => handle.log(format!(
                "{} is not the active version of {}",
                self.namer.remote_name(index, seq),
                index
            )),
            (None, None) => handle.log(format!("{} had no active version", index)),
        }

        let action = self
            .ledger
            .complete(
                handle,
                ActionStatus::Success,
                json!({ "previous": previous, "noop": noop }),
            )
            .await?;
        Ok(TransitionOutcome {
            action,
            version: None,
            noop,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Clear
    // ═══════════════════════════════════════════════════════════════════════

    /// Delete every document but keep the remote index; resets the watermark
    pub async fn clear_version<'o>(
        &self,
        key: &VersionKey,
        origin: impl Into<ActionOrigin<'o>>,
    ) -> Result<TransitionOutcome> {
        let origin: ActionOrigin<'_> = origin.into();
        let mut version = self.load_version(key).await?;
        if !version.is_built() {
            return Err(OrchestratorError::VersionNotBuilt(key.to_string()));
        }

        let remote_name = version.remote_name();
        let mut handle = self
            .ledger
            .open(ActionKind::Clear, key.clone(), origin)
            .await?;

        if let Err(e) = self.client.clear_remote_index(&remote_name).await {
            let err = OrchestratorError::RemoteBulkWrite {
                name: remote_name,
                reason: e.to_string(),
            };
            self.ledger.fail(handle, &err).await?;
            return Err(err);
        }

        let removed = version.doc_count;
        version.last_successful_update = None;
        version.doc_count = 0;
        version.cleared_at = Some(Utc::now());
        self.store.update_version(&version).await?;

        handle.set_docs_affected(removed);
        handle.log(format!("Cleared {} ({} documents)", remote_name, removed));
        let action = self
            .ledger
            .complete(handle, ActionStatus::Success, json!({ "removed": removed }))
            .await?;
        Ok(TransitionOutcome {
            action,
            version: Some(version),
            noop: false,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Drop
    // ═══════════════════════════════════════════════════════════════════════

    /// Delete the remote index and mark the version dropped
    ///
    /// Dropping the active version empties the pointer; nothing else is
    /// promoted. A version that is already dropped is a no-op (unless
    /// `hard_delete` asks for the row to go too).
    pub async fn drop_version<'o>(
        &self,
        key: &VersionKey,
        hard_delete: bool,
        origin: impl Into<ActionOrigin<'o>>,
    ) -> Result<TransitionOutcome> {
        let origin: ActionOrigin<'_> = origin.into();
        let mut version = self.load_version(key).await?;
        let remote_name = version.remote_name();
        let mut handle = self
            .ledger
            .open(ActionKind::Drop, key.clone(), origin)
            .await?;

        if version.is_dropped() {
            handle.log(format!("{} is already dropped", remote_name));
            if hard_delete {
                self.store.delete_version(key).await?;
                handle.log(format!("Deleted catalog row of {}", remote_name));
            }
            let action = self
                .ledger
                .complete(
                    handle,
                    ActionStatus::Success,
                    json!({ "noop": !hard_delete, "hard_delete": hard_delete }),
                )
                .await?;
            return Ok(TransitionOutcome {
                action,
                version: (!hard_delete).then_some(version),
                noop: !hard_delete,
            });
        }

        let was_active = self
            .store
            .get_index(&key.index)
            .await?
            .and_then(|i| i.active_version(self.namer.prefix()))
            == Some(key.sequence);

        if version.state != VersionState::PendingDrop {
            if let Err(err) = advance(&mut version, VersionState::PendingDrop) {
                self.ledger.fail(handle, &err).await?;
                return Err(err);
            }
            self.store.update_version(&version).await?;
        }

        match self.client.drop_remote_index(&remote_name).await {
            Ok(()) => handle.log(format!("Dropped remote index {}", remote_name)),
            Err(e) if e.is_not_found() => {
                handle.log(format!("Remote index {} was already gone", remote_name))
            }
            Err(e) => {
                warn!("Drop of {} failed; version left pending drop", remote_name);
                let err = OrchestratorError::RemoteIndexDrop {
                    name: remote_name,
                    reason: e.to_string(),
                };
                self.ledger.fail(handle, &err).await?;
                return Err(err);
            }
        }

        let dropped = self.store.mark_dropped(key, Utc::now()).await?;
        if was_active {
            handle.warn(format!(
                "{} was active; {} now has no active version",
                remote_name, key.index
            ));
        }
        if hard_delete {
            self.store.delete_version(key).await?;
            handle.log(format!("Deleted catalog row of {}", remote_name));
        }

        let action = self
            .ledger
            .complete(
                handle,
                ActionStatus::Success,
                json!({
                    "noop": false,
                    "was_active": was_active,
                    "hard_delete": hard_delete,
                }),
            )
            .await?;
        Ok(TransitionOutcome {
            action,
            version: (!hard_delete).then_some(dropped),
            noop: false,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reset
    // ═══════════════════════════════════════════════════════════════════════

    /// Drop every remote index of this environment that the catalog knows
    ///
    /// Only versions created under this environment's prefix, and orphaned
    /// remote indexes carrying it, are touched. `RebuildRemote` recreates the
    /// available versions from their stored schemas afterwards. `Everything`
    /// also purges this environment from the catalog; the reset action itself
    /// is written back afterwards so the audit trail keeps the reset.
    pub async fn reset_all<'o>(
        &self,
        scope: ResetScope,
        confirmation: Confirmation,
        origin: impl Into<ActionOrigin<'o>>,
    ) -> Result<TransitionOutcome> {
        let origin: ActionOrigin<'_> = origin.into();
        if confirmation != Confirmation::Confirmed {
            return Err(OrchestratorError::ResetNotConfirmed);
        }
        let prefix = self.namer.prefix();

        let mut handle = self
            .ledger
            .open(ActionKind::Reset, ActionTarget::Global, origin)
            .await?;

        let indexes = self.store.list_indexes().await?;
        let mut targets: Vec<String> = Vec::new();
        let mut versions: Vec<IndexVersion> = Vec::new();
        for index in &indexes {
            for version in self.environment_versions(&index.name).await? {
                if !version.is_dropped() {
                    targets.push(version.remote_name());
                }
                versions.push(version);
            }
        }

        // Orphans: remote indexes of a known index with no catalog row
        let remote_names = match self.client.list_remote_index_names().await {
            Ok(names) => names,
            Err(e) => {
                let err = OrchestratorError::RemoteIndexDrop {
                    name: "*".to_string(),
                    reason: e.to_string(),
                };
                self.ledger.fail(handle, &err).await?;
                return Err(err);
            }
        };
        for name in remote_names {
            let known = self.namer.owns_remote_name(&name)
                && self
                    .namer
                    .parse_version_name(&name)
                    .map_or(false, |key| indexes.iter().any(|i| i.name == key.index));
            if known && !targets.contains(&name) {
                targets.push(name);
            }
        }
        targets.sort();

        let mut failures: Vec<String> = Vec::new();
        for name in &targets {
            match self.client.drop_remote_index(name).await {
                Ok(()) => handle.log(format!("Dropped remote index {}", name)),
                Err(e) if e.is_not_found() => {}
                Err(e) => failures.push(format!("{}: {}", name, e)),
            }
        }
        if !failures.is_empty() {
            let err = OrchestratorError::RemoteIndexDrop {
                name: failures.join(", "),
                reason: format!("{} of {} drops failed", failures.len(), targets.len()),
            };
            self.ledger.fail(handle, &err).await?;
            return Err(err);
        }

        let now = Utc::now();
        let mut recreated: Vec<String> = Vec::new();
        if scope == ResetScope::RebuildRemote {
            for mut version in versions.into_iter().filter(|v| !v.is_dropped()) {
                if !version.is_available() {
                    self.store.mark_dropped(&version.key, now).await?;
                    continue;
                }
                match self.rebuild_remote(&mut version, now).await {
                    Ok(()) => {
                        handle.log(format!("Recreated remote index {}", version.remote_name()));
                        recreated.push(version.remote_name());
                    }
                    Err(err) => {
                        self.ledger.fail(handle, &err).await?;
                        return Err(err);
                    }
                }
            }
        } else {
            for version in versions.iter().filter(|v| !v.is_dropped()) {
                self.store.mark_dropped(&version.key, now).await?;
            }
            for index in &indexes {
                self.store.set_active_version(&index.name, prefix, None).await?;
            }
        }

        if scope == ResetScope::Everything {
            self.store.purge_environment(prefix).await?;
            self.store.insert_action(handle.record()).await?;
            handle.warn(format!(
                "Catalog purged: indexes, versions and actions of environment {:?} removed",
                prefix
            ));
        }

        info!(
            "Reset dropped {} remote indexes, recreated {} ({:?})",
            targets.len(),
            recreated.len(),
            scope
        );
        let action = self
            .ledger
            .complete(
                handle,
                ActionStatus::Success,
                json!({
                    "scope": format!("{:?}", scope),
                    "dropped": targets,
                    "recreated": recreated,
                }),
            )
            .await?;
        Ok(TransitionOutcome {
            action,
            version: None,
            noop: false,
        })
    }

    /// Recreate the remote index of `version` from its stored schema
    ///
    /// The new index is empty, so the watermark is reset the way a clear
    /// resets it.
    async fn rebuild_remote(&self, version: &mut IndexVersion, at: DateTime<Utc>) -> Result<()> {
        let remote_name = version.remote_name();
        let schema = IndexSchema::new(version.schema_json.clone());
        match self.client.create_remote_index(&remote_name, &schema).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => {
                return Err(OrchestratorError::RemoteIndexCreate {
                    name: remote_name,
                    reason: e.to_string(),
                })
            }
        }

        advance(version, VersionState::Built)?;
        version.doc_count = 0;
        version.last_successful_update = None;
        version.cleared_at = Some(at);
        self.store.update_version(version).await?;
        Ok(())
    }
}

/// Move `version` to `to`, refusing moves the state machine does not allow
fn advance(version: &mut IndexVersion, to: VersionState) -> Result<()> {
    if !version.state.can_transition_to(to) {
        return Err(OrchestratorError::InvalidStateTransition {
            from: version.state.to_string(),
            to: to.to_string(),
        });
    }
    version.state = to;
    Ok(())
}
