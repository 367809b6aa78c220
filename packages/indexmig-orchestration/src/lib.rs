//! Index version lifecycle management
//!
//! Every logical search index (`movies`) is backed by numbered versions in the
//! remote search engine (`dev_movies-3`). A new version is created when the
//! schema fingerprint changes, filled by a (resumable, concurrent) reindex,
//! activated by flipping the environment's persisted pointer, and eventually
//! cleared or dropped. Environments (prefixes) share one catalog without
//! seeing each other's versions. Every mutation is recorded in an append-only action ledger.
//!
//! Architecture:
//! - `naming`: base names, version names, environment prefix
//! - `fingerprint`: order-independent schema hashing
//! - `versions`: create / activate / deactivate / clear / drop / reset
//! - `reindex`: feeder + worker pool streaming documents into a version
//! - `ledger`: `IndexAction` records with heartbeat and exactly-once completion
//! - `lease`: one running update per version
//! - `manager`: the operation surface tying it together
//!
//! Persistence lives in `indexmig-storage`.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod lease;
pub mod logging;
pub mod manager;
pub mod naming;
pub mod producer;
pub mod reindex;
pub mod remote;
pub mod versions;

// Re-exports
pub use config::{ConfigError, ManagerConfig, WorkerCount};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use fingerprint::IndexSchema;
pub use ledger::{ActionHandle, ActionLedger, ActionOrigin, ActionTarget};
pub use lease::{LeaseGuard, UpdateLeases};
pub use logging::init_tracing;
pub use manager::{IndexManager, ListingRow, OperationOutcome};
pub use naming::{IndexNamer, Resolved};
pub use producer::{DocumentProducer, DocumentStream, InMemoryDocumentProducer, SearchDocument};
pub use reindex::{ReindexEngine, UpdateMode, UpdateOptions, UpdateReport};
pub use remote::{
    BulkWriteResponse, DocumentFailure, InMemoryIndexClient, RemoteError, RemoteErrorKind,
    RemoteIndexClient,
};
pub use versions::{Confirmation, ResetScope, TransitionOutcome, VersionStateMachine};

pub use indexmig_storage::{
    ActionKind, ActionStatus, CatalogStore, Index, IndexAction, IndexVersion, VersionKey,
    VersionState,
};
