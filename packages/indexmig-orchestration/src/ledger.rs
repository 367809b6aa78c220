//! Action ledger
//!
//! Every mutating operation opens an `IndexAction` in `InProgress`, may
//! heartbeat while it runs, and is completed exactly once. `complete`
//! consumes the `ActionHandle`, so a second completion does not compile; the
//! catalog independently refuses to touch a terminal row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmig_storage::{ActionKind, ActionStatus, CatalogStore, IndexAction, VersionKey};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// What an action is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTarget {
    /// Cluster-wide (reset)
    Global,
    Index(String),
    Version(VersionKey),
}

impl ActionTarget {
    fn split(self) -> (Option<String>, Option<VersionKey>) {
        match self {
            ActionTarget::Global => (None, None),
            ActionTarget::Index(name) => (Some(name), None),
            ActionTarget::Version(key) => (Some(key.index.clone()), Some(key)),
        }
    }
}

impl From<VersionKey> for ActionTarget {
    fn from(key: VersionKey) -> Self {
        ActionTarget::Version(key)
    }
}

impl From<&str> for ActionTarget {
    fn from(index: &str) -> Self {
        ActionTarget::Index(index.to_string())
    }
}

/// How an action is opened: with a caller-supplied context, or as a
/// sub-action of a running parent
#[derive(Debug, Clone, Copy)]
pub enum ActionOrigin<'a> {
    Context(&'a str),
    Parent(&'a ActionHandle),
}

impl<'a> From<&'a str> for ActionOrigin<'a> {
    fn from(context: &'a str) -> Self {
        ActionOrigin::Context(context)
    }
}

impl<'a> From<&'a String> for ActionOrigin<'a> {
    fn from(context: &'a String) -> Self {
        ActionOrigin::Context(context.as_str())
    }
}

impl<'a> From<&'a ActionHandle> for ActionOrigin<'a> {
    fn from(parent: &'a ActionHandle) -> Self {
        ActionOrigin::Parent(parent)
    }
}

/// An open action. Log lines are buffered here and persisted on heartbeat
/// and completion.
#[derive(Debug)]
pub struct ActionHandle {
    action: IndexAction,
}

impl ActionHandle {
    pub fn id(&self) -> Uuid {
        self.action.id
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.action.started_at
    }

    pub fn record(&self) -> &IndexAction {
        &self.action
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(action = %self.action.id, kind = %self.action.kind, "{}", message);
        self.action.log.push(message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(action = %self.action.id, kind = %self.action.kind, "{}", message);
        self.action.log.push(format!("WARNING: {}", message));
    }

    pub fn set_docs_affected(&mut self, docs: u64) {
        self.action.docs_affected = docs;
    }
}

pub struct ActionLedger {
    store: Arc<dyn CatalogStore>,
    stall_after: chrono::Duration,
    environment: String,
}

impl ActionLedger {
    pub fn new(store: Arc<dyn CatalogStore>, stall_after: chrono::Duration) -> Self {
        Self {
            store,
            stall_after,
            environment: String::new(),
        }
    }

    /// Stamp every recorded action with environment `prefix`
    pub fn in_environment(mut self, prefix: impl Into<String>) -> Self {
        self.environment = prefix.into();
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Open an action in `InProgress`
    pub async fn record(
        &self,
        kind: ActionKind,
        target: impl Into<ActionTarget>,
        context: &str,
    ) -> Result<ActionHandle> {
        let (index, version) = target.into().split();
        let action =
            IndexAction::new(kind, index, version, context).in_environment(self.environment.as_str());
        self.store.insert_action(&action).await?;
        Ok(ActionHandle { action })
    }

    /// Open a sub-action linked to `parent` (same context)
    pub async fn child_of(
        &self,
        parent: &ActionHandle,
        kind: ActionKind,
        target: impl Into<ActionTarget>,
    ) -> Result<ActionHandle> {
        let (index, version) = target.into().split();
        let mut action = IndexAction::new(kind, index, version, parent.action.context.clone())
            .in_environment(self.environment.as_str());
        action.parent = Some(parent.id());
        self.store.insert_action(&action).await?;
        Ok(ActionHandle { action })
    }

    /// `record` or `child_of`, depending on `origin`
    pub async fn open(
        &self,
        kind: ActionKind,
        target: impl Into<ActionTarget>,
        origin: ActionOrigin<'_>,
    ) -> Result<ActionHandle> {
        match origin {
            ActionOrigin::Context(context) => self.record(kind, target, context).await,
            ActionOrigin::Parent(parent) => self.child_of(parent, kind, target).await,
        }
    }

    /// Persist progress and refresh the heartbeat
    pub async fn heartbeat(&self, handle: &mut ActionHandle, docs_affected: u64) -> Result<()> {
        handle.action.heartbeat_at = Utc::now();
        handle.action.docs_affected = docs_affected;
        self.store.update_action(&handle.action).await?;
        Ok(())
    }

    /// Finalize the action. Transition: IN_PROGRESS → {SUCCESS, PARTIAL, FAILED}
    pub async fn complete(
        &self,
        handle: ActionHandle,
        status: ActionStatus,
        payload: serde_json::Value,
    ) -> Result<IndexAction> {
        if !status.is_terminal() {
            return Err(OrchestratorError::InvalidStateTransition {
                from: handle.action.status.to_string(),
                to: status.to_string(),
            });
        }

        let mut action = handle.action;
        let now = Utc::now();
        action.status = status;
        action.heartbeat_at = now;
        action.finished_at = Some(now);
        action.payload = payload;
        self.store.update_action(&action).await?;

        let elapsed_ms = (now - action.started_at).num_milliseconds();
        match status {
            ActionStatus::Failed => error!(
                "{} action {} failed after {}ms",
                action.kind, action.id, elapsed_ms
            ),
            ActionStatus::Partial => warn!(
                "{} action {} finished partially after {}ms",
                action.kind, action.id, elapsed_ms
            ),
            _ => info!(
                "{} action {} finished after {}ms",
                action.kind, action.id, elapsed_ms
            ),
        }
        Ok(action)
    }

    /// Finalize as `Failed` with the error recorded in the log and payload
    pub async fn fail(
        &self,
        mut handle: ActionHandle,
        err: &OrchestratorError,
    ) -> Result<IndexAction> {
        handle.warn(err.to_string());
        let payload = serde_json::json!({
            "error": err.to_string(),
            "category": err.category().as_str(),
        });
        self.complete(handle, ActionStatus::Failed, payload).await
    }

    pub async fn latest_for(
        &self,
        index: &str,
        version: Option<&VersionKey>,
    ) -> Result<Option<IndexAction>> {
        Ok(self.store.latest_action_for(index, version).await?)
    }

    pub async fn between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<IndexAction>> {
        Ok(self.store.actions_between(from, to).await?)
    }

    /// In-progress actions whose last heartbeat is older than `stall_after`
    pub async fn stalled(&self, now: DateTime<Utc>) -> Result<Vec<IndexAction>> {
        let cutoff = now - self.stall_after;
        Ok(self
            .store
            .in_progress_actions()
            .await?
            .into_iter()
            .filter(|action| action.heartbeat_at < cutoff)
            .collect())
    }
}
