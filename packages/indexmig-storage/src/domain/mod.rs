//! Domain layer for the index catalog
//!
//! # Domain Models
//!
//! - `Index`: logical base name plus one active-version pointer per environment
//! - `IndexVersion`: one concrete remote index, immutable schema
//! - `IndexAction`: append-only audit record
//!
//! # Port Trait
//!
//! - `CatalogStore`: primary storage abstraction
//!
//! # Examples
//!
//! ```rust,ignore
//! use indexmig_storage::domain::{CatalogStore, NewVersion, VersionKey};
//!
//! async fn example(store: impl CatalogStore) -> Result<()> {
//!     let version = store
//!         .allocate_version(NewVersion::new("movies", "dev_", "3f2a...", schema, "v1"))
//!         .await?;
//!     assert_eq!(version.remote_name(), "dev_movies-1");
//!
//!     // Flip the dev_ pointer, previous value comes back
//!     let previous = store.set_active_version("movies", "dev_", Some(1)).await?;
//!     assert_eq!(previous, None);
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Index
// ═══════════════════════════════════════════════════════════════════════════

/// Logical index, identified by its base name
///
/// Several environments (prefixes) may share one catalog. Each keeps its own
/// pointer in `active`, so an environment can never have two active versions
/// of one index and never sees another environment's choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Base name (naming root of every remote index in this family)
    pub name: String,
    /// Active sequence number per environment prefix
    #[serde(default)]
    pub active: BTreeMap<String, u32>,
    /// Highest sequence number ever allocated (never decreases)
    pub last_sequence: u32,
    pub created_at: DateTime<Utc>,
}

impl Index {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: BTreeMap::new(),
            last_sequence: 0,
            created_at: Utc::now(),
        }
    }

    /// Sequence number of the version active in environment `prefix`
    pub fn active_version(&self, prefix: &str) -> Option<u32> {
        self.active.get(prefix).copied()
    }

    /// Key of the version active in environment `prefix`
    pub fn active_key(&self, prefix: &str) -> Option<VersionKey> {
        self.active_version(prefix)
            .map(|sequence| VersionKey::new(self.name.clone(), sequence))
    }

    /// Drop whichever pointer names `sequence`
    pub fn release_pointer(&mut self, sequence: u32) {
        self.active.retain(|_, active| *active != sequence);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IndexVersion
// ═══════════════════════════════════════════════════════════════════════════

/// Identity of a version: base name plus sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionKey {
    pub index: String,
    pub sequence: u32,
}

impl VersionKey {
    pub fn new(index: impl Into<String>, sequence: u32) -> Self {
        Self {
            index: index.into(),
            sequence,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.index, self.sequence)
    }
}

/// Persisted lifecycle state of a version
///
/// ```text
/// Declared ──► Built ──► PendingDrop ──► Dropped
///     │                       ▲
///     └───────────────────────┘
/// ```
///
/// Active/inactive is not a state: it is read from `Index::active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    /// Row exists, remote index not (yet) created
    Declared,
    /// Remote index exists
    Built,
    /// Remote drop requested but not confirmed
    PendingDrop,
    /// Remote index deleted; row kept for audit
    Dropped,
}

impl VersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionState::Declared => "declared",
            VersionState::Built => "built",
            VersionState::PendingDrop => "pending_drop",
            VersionState::Dropped => "dropped",
        }
    }

    /// Whether moving to `to` is a legal transition
    ///
    /// Staying in the same state is not a transition and always allowed.
    pub fn can_transition_to(&self, to: VersionState) -> bool {
        if *self == to {
            return true;
        }
        use VersionState::*;
        matches!(
            (self, to),
            (Declared, Built)
                | (Declared, PendingDrop)
                | (Built, PendingDrop)
                | (PendingDrop, Dropped)
                | (Declared, Dropped)
                | (Built, Dropped)
        )
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "declared" => Ok(VersionState::Declared),
            "built" => Ok(VersionState::Built),
            "pending_drop" => Ok(VersionState::PendingDrop),
            "dropped" => Ok(VersionState::Dropped),
            other => Err(StorageError::serialization(format!(
                "Unknown version state: {}",
                other
            ))),
        }
    }
}

/// One concrete instantiation of a schema in the remote search engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexVersion {
    pub key: VersionKey,
    /// Environment prefix captured at creation
    pub prefix: String,
    /// Schema fingerprint, immutable
    pub fingerprint: String,
    /// Schema the remote index was created with
    #[serde(default)]
    pub schema_json: serde_json::Value,
    /// Codebase identifier of the process that created the version
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub state: VersionState,
    /// Watermark: start time of the last fully successful update
    pub last_successful_update: Option<DateTime<Utc>>,
    /// Start time of the last update attempt, whatever its outcome
    pub last_attempted_update: Option<DateTime<Utc>>,
    /// Cached remote document count
    pub doc_count: u64,
    pub cleared_at: Option<DateTime<Utc>>,
    /// Soft-delete time (set when the version reaches `Dropped`)
    pub deleted_at: Option<DateTime<Utc>>,
}

impl IndexVersion {
    /// Remote index identifier: `{prefix}{index}-{sequence}`
    pub fn remote_name(&self) -> String {
        format!("{}{}", self.prefix, self.key)
    }

    pub fn is_built(&self) -> bool {
        self.state == VersionState::Built
    }

    pub fn is_dropped(&self) -> bool {
        self.state == VersionState::Dropped
    }

    /// Not dropped and not on its way out
    pub fn is_available(&self) -> bool {
        matches!(self.state, VersionState::Declared | VersionState::Built)
    }
}

/// Parameters for `CatalogStore::allocate_version`
#[derive(Debug, Clone, PartialEq)]
pub struct NewVersion {
    pub index: String,
    pub prefix: String,
    pub fingerprint: String,
    pub schema_json: serde_json::Value,
    pub tag: String,
}

impl NewVersion {
    pub fn new(
        index: impl Into<String>,
        prefix: impl Into<String>,
        fingerprint: impl Into<String>,
        schema_json: serde_json::Value,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            index: index.into(),
            prefix: prefix.into(),
            fingerprint: fingerprint.into(),
            schema_json,
            tag: tag.into(),
        }
    }

    /// Materialize the `Declared` row for an allocated sequence number
    pub fn into_version(self, sequence: u32) -> IndexVersion {
        IndexVersion {
            key: VersionKey::new(self.index, sequence),
            prefix: self.prefix,
            fingerprint: self.fingerprint,
            schema_json: self.schema_json,
            tag: self.tag,
            created_at: Utc::now(),
            state: VersionState::Declared,
            last_successful_update: None,
            last_attempted_update: None,
            doc_count: 0,
            cleared_at: None,
            deleted_at: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IndexAction
// ═══════════════════════════════════════════════════════════════════════════

/// Kind of mutating operation recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Activate,
    Deactivate,
    Clear,
    Drop,
    Reset,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Activate => "activate",
            ActionKind::Deactivate => "deactivate",
            ActionKind::Clear => "clear",
            ActionKind::Drop => "drop",
            ActionKind::Reset => "reset",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(ActionKind::Create),
            "update" => Ok(ActionKind::Update),
            "activate" => Ok(ActionKind::Activate),
            "deactivate" => Ok(ActionKind::Deactivate),
            "clear" => Ok(ActionKind::Clear),
            "drop" => Ok(ActionKind::Drop),
            "reset" => Ok(ActionKind::Reset),
            other => Err(StorageError::serialization(format!(
                "Unknown action kind: {}",
                other
            ))),
        }
    }
}

/// Outcome of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    InProgress,
    Success,
    Partial,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::InProgress => "in_progress",
            ActionStatus::Success => "success",
            ActionStatus::Partial => "partial",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionStatus::InProgress)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(ActionStatus::InProgress),
            "success" => Ok(ActionStatus::Success),
            "partial" => Ok(ActionStatus::Partial),
            "failed" => Ok(ActionStatus::Failed),
            other => Err(StorageError::serialization(format!(
                "Unknown action status: {}",
                other
            ))),
        }
    }
}

/// Append-only audit record of one mutating operation
///
/// Written once when the operation starts (`InProgress`), refreshed by
/// heartbeats, and finalized exactly once. Terminal rows never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAction {
    pub id: Uuid,
    pub kind: ActionKind,
    /// Target index (None for a global reset)
    pub index: Option<String>,
    /// Target version; may dangle after a hard delete
    pub version: Option<VersionKey>,
    /// Parent action for fan-out operations
    pub parent: Option<Uuid>,
    pub status: ActionStatus,
    /// Actor-supplied reason
    pub context: String,
    /// Prefix of the environment that recorded the action
    #[serde(default)]
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub docs_affected: u64,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl IndexAction {
    pub fn new(
        kind: ActionKind,
        index: Option<String>,
        version: Option<VersionKey>,
        context: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            index,
            version,
            parent: None,
            status: ActionStatus::InProgress,
            context: context.into(),
            environment: String::new(),
            started_at: now,
            heartbeat_at: now,
            finished_at: None,
            docs_affected: 0,
            log: Vec::new(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn in_environment(mut self, prefix: impl Into<String>) -> Self {
        self.environment = prefix.into();
        self
    }

    /// Whether this action targets `index` (and `version`, when given)
    pub fn targets(&self, index: &str, version: Option<&VersionKey>) -> bool {
        if self.index.as_deref() != Some(index) {
            return false;
        }
        match version {
            Some(key) => self.version.as_ref() == Some(key),
            None => true,
        }
    }

    /// Wall-clock duration, once finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: CatalogStore
// ═══════════════════════════════════════════════════════════════════════════

/// Durable store for indexes, versions and actions
///
/// # Core Operations
///
/// 1. **Indexes**: `get_or_create_index`, `get_index`, `list_indexes`
/// 2. **Versions**: `allocate_version`, `get_version`, `list_versions`,
///    `update_version`, `mark_dropped`, `delete_version`
/// 3. **Active pointer**: `set_active_version` (single atomic write per environment)
/// 4. **Ledger**: `insert_action`, `update_action`, `get_action`,
///    `latest_action_for`, `actions_between`, `in_progress_actions`
/// 5. **Reset**: `purge_environment`
///
/// Version state changes (`update_version`, `mark_dropped`) are checked
/// against `VersionState::can_transition_to` and refused with
/// `InvalidTransition`.
///
/// # Implementations
///
/// - `InMemoryCatalog`: process-local, for tests and embedded use
/// - `SqliteCatalog`: durable, one transaction per multi-row change
#[async_trait]
pub trait CatalogStore: Send + Sync {
    // ═══════════════════════════════════════════════════════════════════════
    // Index Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Fetch an index, creating it on first use
    async fn get_or_create_index(&self, name: &str) -> Result<Index>;

    async fn get_index(&self, name: &str) -> Result<Option<Index>>;

    /// All indexes, ordered by name
    async fn list_indexes(&self) -> Result<Vec<Index>>;

    // ═══════════════════════════════════════════════════════════════════════
    // Version Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Allocate the next sequence number and insert a `Declared` row
    ///
    /// Bumping `Index::last_sequence` and inserting the row happen
    /// atomically. The index is created if it does not exist yet.
    async fn allocate_version(&self, new: NewVersion) -> Result<IndexVersion>;

    async fn get_version(&self, key: &VersionKey) -> Result<Option<IndexVersion>>;

    /// All versions of an index (dropped ones included), ordered by sequence
    async fn list_versions(&self, index: &str) -> Result<Vec<IndexVersion>>;

    /// Persist mutable version fields (state, timestamps, counts)
    ///
    /// # Errors
    ///
    /// - `VersionNotFound` if the row does not exist
    /// - `InvalidTransition` if the stored state cannot move to the new one
    async fn update_version(&self, version: &IndexVersion) -> Result<()>;

    /// Point environment `prefix` of the index at `sequence` (or nothing);
    /// returns the previous pointer of that environment
    ///
    /// # Errors
    ///
    /// - `IndexNotFound` if the index does not exist
    /// - `VersionNotFound` if `sequence` names no version of this index
    ///   created under `prefix`
    async fn set_active_version(
        &self,
        index: &str,
        prefix: &str,
        sequence: Option<u32>,
    ) -> Result<Option<u32>>;

    /// Mark a version `Dropped` and clear the active pointer if it pointed here
    ///
    /// Both writes are applied together. A `Dropped` version is refused with
    /// `InvalidTransition`.
    async fn mark_dropped(&self, key: &VersionKey, at: DateTime<Utc>) -> Result<IndexVersion>;

    /// Remove the version row. Actions referencing it are left untouched.
    async fn delete_version(&self, key: &VersionKey) -> Result<()>;

    // ═══════════════════════════════════════════════════════════════════════
    // Action Operations
    // ═══════════════════════════════════════════════════════════════════════

    async fn insert_action(&self, action: &IndexAction) -> Result<()>;

    /// Overwrite an in-progress action
    ///
    /// # Errors
    ///
    /// - `ActionNotFound` if the action does not exist
    /// - `ActionFinalized` if the stored row is already terminal
    async fn update_action(&self, action: &IndexAction) -> Result<()>;

    async fn get_action(&self, id: Uuid) -> Result<IndexAction>;

    /// Most recently started action targeting `index` (and `version`)
    async fn latest_action_for(
        &self,
        index: &str,
        version: Option<&VersionKey>,
    ) -> Result<Option<IndexAction>>;

    /// Actions started within `[from, to]`, oldest first
    async fn actions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<IndexAction>>;

    /// Actions that never reached a terminal status
    async fn in_progress_actions(&self) -> Result<Vec<IndexAction>>;

    // ═══════════════════════════════════════════════════════════════════════
    // Reset
    // ═══════════════════════════════════════════════════════════════════════

    /// Delete every version, pointer and action of environment `prefix`
    ///
    /// Indexes left without any version are deleted too. Rows of other
    /// environments are untouched.
    async fn purge_environment(&self, prefix: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
