//! Infrastructure layer - Catalog adapters
//!
//! - `memory`: process-local catalog
//! - `sqlite`: durable catalog (feature `sqlite`)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryCatalog;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCatalog;
