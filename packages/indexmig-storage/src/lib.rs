//! IndexCatalog - persisted state for versioned search indexes
//!
//! > "the search engine cannot change a live mapping, so every schema change is a new index."
//!
//! ## Core Principles
//!
//! 1. **Versions are immutable**: a version's fingerprint never changes after creation
//! 2. **One pointer per index and environment**: "active" lives only in
//!    `Index::active`, keyed by prefix, so each environment has at most one
//!    active version by construction
//! 3. **Append-only ledger**: an `IndexAction` that reached a terminal status is never modified
//!
//! ## Entities
//!
//! - `Index`: logical base name, owns its versions, carries the active pointers
//! - `IndexVersion`: one concrete remote index (`{prefix}{base}-{sequence}`)
//! - `IndexAction`: audit record of every mutating operation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use indexmig_storage::{CatalogStore, InMemoryCatalog, NewVersion};
//!
//! let store = InMemoryCatalog::new();
//! store.get_or_create_index("movies").await?;
//!
//! let version = store
//!     .allocate_version(NewVersion::new("movies", "", fingerprint, schema_json, "v1.2.0"))
//!     .await?;
//! assert_eq!(version.remote_name(), "movies-1");
//!
//! store.set_active_version("movies", "", Some(version.key.sequence)).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    ActionKind, ActionStatus, CatalogStore, Index, IndexAction, IndexVersion, NewVersion,
    VersionKey, VersionState,
};

pub use infrastructure::InMemoryCatalog;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteCatalog;
