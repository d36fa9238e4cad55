//! Credential providers and their registry.
//!
//! This module provides:
//! - [`CredentialProvider`] - The capability set every credential source implements
//! - [`ProviderRegistry`] - Maps a configured type tag to a provider constructor
//!
//! A provider is created per run from its [`ProviderConfig`] and the primary
//! session's backend client. The orchestrator then drives it through the same
//! sequence: [`load_cached`](CredentialProvider::load_cached), then
//! [`generate`](CredentialProvider::generate) if the cached record was not
//! enough, then reads its lines if [`is_loaded`](CredentialProvider::is_loaded).
//!
//! # Built-in providers
//!
//! | Tag | Implementation |
//! |---|---|
//! | `consul`, `nomad` | [`LeaseProvider`] |
//! | `secret`, `openstack`, `infoblox` | [`SecretMapProvider`] |
//! | `text` | [`TextProvider`] |
//! | `keepass` | [`KeePassProvider`] |

use std::collections::HashMap;

use async_trait::async_trait;

use crate::backend::VaultClient;
use crate::config::ProviderConfig;
use crate::credential::{self, EnvVar};
use crate::error::Result;

mod keepass;
mod lease;
mod secret_map;
mod text;

pub use keepass::{EntryGroup, KeePassProvider};
pub use lease::{LeaseFlavor, LeaseProvider};
pub use secret_map::{SecretFlavor, SecretMapProvider};
pub use text::TextProvider;

/// A secondary credential source.
#[async_trait]
pub trait CredentialProvider: Send {
    /// Type tag this provider was registered under.
    fn kind(&self) -> &str;

    /// Rebuild the in-memory record from previously cached lines.
    ///
    /// Lines that belong to other providers are ignored.
    fn load_cached(&mut self, lines: &[String]);

    /// Contact the backend (or static source) to produce the record.
    async fn generate(&mut self) -> Result<()>;

    /// Whether the in-memory record is complete and not expired.
    fn is_loaded(&self) -> bool;

    /// Variables of the current record, in output order.
    fn vars(&self) -> Vec<EnvVar>;

    /// `export NAME="VALUE"` lines.
    fn export_lines(&self) -> Vec<String> {
        credential::export_lines(&self.vars())
    }

    /// `NAME="VALUE"` lines for the cache.
    fn cache_lines(&self) -> Vec<String> {
        credential::cache_lines(&self.vars())
    }
}

/// Constructor registered for a type tag.
pub type ProviderFactory = fn(&ProviderConfig, &VaultClient) -> Box<dyn CredentialProvider>;

/// Registry of provider constructors keyed by type tag.
///
/// # Example
///
/// ```
/// use clusterprofile_core::provider::ProviderRegistry;
///
/// let registry = ProviderRegistry::with_defaults();
/// assert!(registry.contains("consul"));
/// assert!(!registry.contains("unknown-x"));
/// ```
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry with every built-in provider registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("consul", |config, vault| {
            Box::new(LeaseProvider::new(LeaseFlavor::CONSUL, config.clone(), vault.clone()))
        });
        registry.register("nomad", |config, vault| {
            Box::new(LeaseProvider::new(LeaseFlavor::NOMAD, config.clone(), vault.clone()))
        });
        registry.register("secret", |config, vault| {
            Box::new(SecretMapProvider::new(SecretFlavor::Generic, config.clone(), vault.clone()))
        });
        registry.register("openstack", |config, vault| {
            Box::new(SecretMapProvider::new(SecretFlavor::OpenStack, config.clone(), vault.clone()))
        });
        registry.register("infoblox", |config, vault| {
            Box::new(SecretMapProvider::new(SecretFlavor::Infoblox, config.clone(), vault.clone()))
        });
        registry.register("text", |config, _| Box::new(TextProvider::new(config.clone())));
        registry.register("keepass", |config, _| Box::new(KeePassProvider::new(config.clone())));

        registry
    }

    /// Register a constructor for a type tag.
    ///
    /// If the tag is already registered, its constructor is replaced.
    pub fn register(&mut self, tag: impl Into<String>, factory: ProviderFactory) {
        self.factories.insert(tag.into(), factory);
    }

    /// Build the provider for a configuration.
    ///
    /// Returns `None` if the configured type tag is not registered.
    pub fn create(
        &self,
        config: &ProviderConfig,
        vault: &VaultClient,
    ) -> Option<Box<dyn CredentialProvider>> {
        self.factories
            .get(config.kind.as_str())
            .map(|factory| factory(config, vault))
    }

    /// Check if a type tag is registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// List registered type tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> VaultClient {
        VaultClient::new("http://127.0.0.1:8200").unwrap()
    }

    fn config(kind: &str) -> ProviderConfig {
        ProviderConfig {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_registry_new_is_empty() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.create(&config("consul"), &vault()).is_none());
    }

    #[test]
    fn test_registry_defaults() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(
            registry.tags(),
            vec!["consul", "infoblox", "keepass", "nomad", "openstack", "secret", "text"]
        );

        for tag in registry.tags() {
            let provider = registry.create(&config(tag), &vault()).unwrap();
            assert_eq!(provider.kind(), tag);
            assert!(provider.export_lines().len() == provider.cache_lines().len());
        }
    }

    #[test]
    fn test_registry_unknown_tag_is_absent() {
        let registry = ProviderRegistry::with_defaults();
        assert!(registry.create(&config("unknown-x"), &vault()).is_none());
    }

    #[test]
    fn test_registry_register_replaces() {
        let mut registry = ProviderRegistry::new();
        registry.register("custom", |config, _| Box::new(TextProvider::new(config.clone())));
        registry.register("custom", |config, _| Box::new(TextProvider::new(config.clone())));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("custom"));
    }
}
