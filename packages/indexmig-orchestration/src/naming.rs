//! Name resolution
//!
//! Operators refer to indexes either by base name (`movies`) or by the
//! concrete version name (`movies-3`, or `dev_movies-3` with the environment
//! prefix). `IndexNamer` turns that input into catalog rows.

use indexmig_storage::{CatalogStore, Index, IndexVersion, VersionKey};

use crate::error::{OrchestratorError, Result};

/// Builds and parses remote index names for one environment prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexNamer {
    prefix: String,
}

/// Outcome of resolving operator input
#[derive(Debug, Clone)]
pub struct Resolved {
    pub index: Index,
    /// Named version, or the active version when a base name was given
    pub version: Option<IndexVersion>,
    /// True when the input named a specific version
    pub exact: bool,
}

impl Resolved {
    /// The resolved version, which must be the active one when resolved by base name
    pub fn require_active(&self) -> Result<&IndexVersion> {
        self.version
            .as_ref()
            .ok_or_else(|| OrchestratorError::NoActiveVersion(self.index.name.clone()))
    }
}

impl IndexNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}{base}-{sequence}`
    pub fn remote_name(&self, base: &str, sequence: u32) -> String {
        format!("{}{}-{}", self.prefix, base, sequence)
    }

    /// Split a version name into its key
    ///
    /// The environment prefix is optional in the input. The sequence is
    /// whatever follows the last `-`, so base names may contain dashes.
    pub fn parse_version_name(&self, name: &str) -> Option<VersionKey> {
        let (base, suffix) = name.rsplit_once('-')?;
        let sequence: u32 = suffix.parse().ok()?;
        let base = match base.strip_prefix(self.prefix.as_str()) {
            Some(stripped) if !self.prefix.is_empty() => stripped,
            _ => base,
        };
        if base.is_empty() {
            return None;
        }
        Some(VersionKey::new(base, sequence))
    }

    /// Whether a remote index name belongs to this environment
    pub fn owns_remote_name(&self, remote_name: &str) -> bool {
        remote_name.starts_with(self.prefix.as_str())
    }

    /// Whether a catalog version was created by this environment
    pub fn owns(&self, version: &IndexVersion) -> bool {
        version.prefix == self.prefix
    }

    /// Resolve a base name or version name against the catalog
    ///
    /// A known base name wins over a version-name parse, so an index that is
    /// literally called `logs-2024` stays reachable by its base name. Versions
    /// of other environments sharing the catalog never resolve.
    pub async fn resolve(&self, store: &dyn CatalogStore, input: &str) -> Result<Resolved> {
        if let Some(index) = store.get_index(input).await? {
            let version = match index.active_key(&self.prefix) {
                Some(key) => store.get_version(&key).await?,
                None => None,
            };
            return Ok(Resolved {
                index,
                version,
                exact: false,
            });
        }

        let key = self
            .parse_version_name(input)
            .ok_or_else(|| OrchestratorError::NameResolution(input.to_string()))?;
        let index = store
            .get_index(&key.index)
            .await?
            .ok_or_else(|| OrchestratorError::NameResolution(input.to_string()))?;
        let version = store
            .get_version(&key)
            .await?
            .filter(|version| self.owns(version))
            .ok_or_else(|| OrchestratorError::NameResolution(input.to_string()))?;

        Ok(Resolved {
            index,
            version: Some(version),
            exact: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmig_storage::{InMemoryCatalog, NewVersion};

    async fn catalog_with_movies() -> InMemoryCatalog {
        let store = InMemoryCatalog::new();
        for fingerprint in ["a", "b"] {
            store
                .allocate_version(NewVersion::new(
                    "movies",
                    "dev_",
                    fingerprint,
                    serde_json::json!({}),
                    "t",
                ))
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn test_remote_name() {
        let namer = IndexNamer::new("dev_");
        assert_eq!(namer.remote_name("movies", 4), "dev_movies-4");
        assert_eq!(IndexNamer::default().remote_name("movies", 4), "movies-4");
    }

    #[test]
    fn test_parse_version_name() {
        let namer = IndexNamer::new("dev_");

        assert_eq!(
            namer.parse_version_name("dev_movies-4"),
            Some(VersionKey::new("movies", 4))
        );
        assert_eq!(
            namer.parse_version_name("movies-4"),
            Some(VersionKey::new("movies", 4))
        );
        assert_eq!(
            namer.parse_version_name("tv-shows-12"),
            Some(VersionKey::new("tv-shows", 12))
        );
        assert_eq!(namer.parse_version_name("movies"), None);
        assert_eq!(namer.parse_version_name("movies-latest"), None);
        assert_eq!(namer.parse_version_name("-3"), None);
    }

    #[test]
    fn test_owns_remote_name() {
        let namer = IndexNamer::new("dev_");
        assert!(namer.owns_remote_name("dev_movies-1"));
        assert!(!namer.owns_remote_name("prod_movies-1"));
    }

    #[tokio::test]
    async fn test_resolve_base_name_without_active() {
        let store = catalog_with_movies().await;
        let namer = IndexNamer::new("dev_");

        let resolved = namer.resolve(&store, "movies").await.unwrap();
        assert_eq!(resolved.index.name, "movies");
        assert!(!resolved.exact);
        assert!(resolved.version.is_none());
        assert!(matches!(
            resolved.require_active(),
            Err(OrchestratorError::NoActiveVersion(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_base_name_to_active() {
        let store = catalog_with_movies().await;
        store.set_active_version("movies", "dev_", Some(2)).await.unwrap();

        let resolved = IndexNamer::new("dev_")
            .resolve(&store, "movies")
            .await
            .unwrap();
        assert_eq!(
            resolved.require_active().unwrap().key,
            VersionKey::new("movies", 2)
        );
    }

    #[tokio::test]
    async fn test_resolve_exact_version() {
        let store = catalog_with_movies().await;
        let namer = IndexNamer::new("dev_");

        let resolved = namer.resolve(&store, "dev_movies-1").await.unwrap();
        assert!(resolved.exact);
        assert_eq!(resolved.version.unwrap().key.sequence, 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let store = catalog_with_movies().await;
        let namer = IndexNamer::new("dev_");

        for input in ["books", "movies-9", "books-1", ""] {
            let err = namer.resolve(&store, input).await.unwrap_err();
            assert!(
                matches!(err, OrchestratorError::NameResolution(_)),
                "input {:?}",
                input
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_ignores_other_environment() {
        let store = catalog_with_movies().await;
        store.set_active_version("movies", "dev_", Some(1)).await.unwrap();
        let prod = IndexNamer::new("prod_");

        let resolved = prod.resolve(&store, "movies").await.unwrap();
        assert!(resolved.version.is_none());

        for input in ["movies-1", "prod_movies-1", "dev_movies-1"] {
            let err = prod.resolve(&store, input).await.unwrap_err();
            assert!(
                matches!(err, OrchestratorError::NameResolution(_)),
                "input {:?}",
                input
            );
        }
    }
}
