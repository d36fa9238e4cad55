//! Multi-variable providers fed from a single backend secret.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::CredentialProvider;
use crate::backend::VaultClient;
use crate::config::ProviderConfig;
use crate::credential::{parse_assignment, EnvVar};
use crate::error::{ClusterProfileError, Result};

/// Which secret provider a [`SecretMapProvider`] acts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretFlavor {
    /// Any secret; a missing secret leaves the provider unloaded.
    Generic,
    /// OpenStack credentials; requires method `secret`.
    OpenStack,
    /// Infoblox credentials; requires method `secret`.
    Infoblox,
}

impl SecretFlavor {
    pub fn kind(self) -> &'static str {
        match self {
            SecretFlavor::Generic => "secret",
            SecretFlavor::OpenStack => "openstack",
            SecretFlavor::Infoblox => "infoblox",
        }
    }

    fn requires_secret_method(self) -> bool {
        !matches!(self, SecretFlavor::Generic)
    }
}

/// Copies selected keys of one secret into output variables.
///
/// `secret_map` maps each secret key to the variable it is exported as. The
/// provider is loaded only when every mapped variable has a non-empty value;
/// a partially cached set is regenerated in full.
pub struct SecretMapProvider {
    flavor: SecretFlavor,
    config: ProviderConfig,
    vault: VaultClient,
    values: BTreeMap<String, String>,
}

impl SecretMapProvider {
    pub fn new(flavor: SecretFlavor, config: ProviderConfig, vault: VaultClient) -> Self {
        Self {
            flavor,
            config,
            vault,
            values: BTreeMap::new(),
        }
    }

    fn is_output(&self, name: &str) -> bool {
        self.config.config.secret_map.values().any(|var| var == name)
    }

    /// Value currently held for an output variable.
    pub fn value(&self, var: &str) -> Option<&str> {
        self.values.get(var).map(String::as_str)
    }
}

#[async_trait]
impl CredentialProvider for SecretMapProvider {
    fn kind(&self) -> &str {
        self.flavor.kind()
    }

    fn load_cached(&mut self, lines: &[String]) {
        for var in lines.iter().filter_map(|line| parse_assignment(line)) {
            if self.is_output(&var.name) {
                self.values.insert(var.name, var.value);
            }
        }
    }

    async fn generate(&mut self) -> Result<()> {
        if self.flavor.requires_secret_method() && self.config.method != "secret" {
            return Err(ClusterProfileError::unsupported(
                format!("{} provider", self.flavor.kind()),
                self.config.method.clone(),
            ));
        }

        let path = self.config.config.path.clone();
        let operation = format!("{} read {}", self.flavor.kind(), path);
        let secret = self
            .vault
            .read(&path)
            .await
            .map_err(|e| ClusterProfileError::backend(&operation, e))?;

        let Some(secret) = secret else {
            if self.flavor.requires_secret_method() {
                return Err(ClusterProfileError::MissingCredential {
                    operation,
                    message: "no secret at path".to_string(),
                });
            }
            tracing::warn!("No secret found at {}", path);
            return Ok(());
        };

        let data = secret.string_values();
        for (key, var) in &self.config.config.secret_map {
            match data.get(key) {
                Some(value) => {
                    self.values.insert(var.clone(), value.clone());
                }
                None => tracing::warn!("Secret {} has no key {}", path, key),
            }
        }
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.config
            .config
            .secret_map
            .values()
            .all(|var| self.values.get(var).is_some_and(|v| !v.is_empty()))
    }

    fn vars(&self) -> Vec<EnvVar> {
        self.config
            .config
            .secret_map
            .values()
            .filter_map(|var| {
                self.values
                    .get(var)
                    .filter(|v| !v.is_empty())
                    .map(|v| EnvVar::new(var, v))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn openstack_config() -> ProviderConfig {
        let mut config = ProviderConfig {
            kind: "openstack".to_string(),
            method: "secret".to_string(),
            ..Default::default()
        };
        config.config.path = "secret/openstack".to_string();
        config
            .config
            .secret_map
            .insert("username".to_string(), "OS_USERNAME".to_string());
        config
            .config
            .secret_map
            .insert("password".to_string(), "OS_PASSWORD".to_string());
        config
    }

    async fn secret_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/openstack"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "lease_duration": 0,
                "data": {"username": "admin", "password": "hunter2", "region": "eu"}
            })))
            .mount(&server)
            .await;
        server
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_complete_cache_is_loaded() {
        let vault = VaultClient::new("http://127.0.0.1:1").unwrap();
        let mut provider = SecretMapProvider::new(SecretFlavor::OpenStack, openstack_config(), vault);
        provider.load_cached(&lines(&[
            r#"VAULT_TOKEN="ignored""#,
            r#"OS_USERNAME="admin""#,
            r#"OS_PASSWORD="hunter2""#,
        ]));

        assert!(provider.is_loaded());
        assert_eq!(provider.vars().len(), 2);
    }

    #[test]
    fn test_missing_or_empty_value_is_not_loaded() {
        let vault = VaultClient::new("http://127.0.0.1:1").unwrap();
        let mut provider =
            SecretMapProvider::new(SecretFlavor::OpenStack, openstack_config(), vault.clone());
        provider.load_cached(&lines(&[r#"OS_USERNAME="admin""#]));
        assert!(!provider.is_loaded());

        let mut provider = SecretMapProvider::new(SecretFlavor::OpenStack, openstack_config(), vault);
        provider.load_cached(&lines(&[r#"OS_USERNAME="admin""#, r#"OS_PASSWORD="""#]));
        assert!(!provider.is_loaded());
    }

    #[test]
    fn test_multiline_value_survives_cache_round_trip() {
        use crate::cache::CredentialCache;

        let mut config = openstack_config();
        config.config.secret_map.clear();
        config
            .config
            .secret_map
            .insert("cert".to_string(), "TLS_CERT".to_string());
        let pem = "-----BEGIN-----\n[prod]\nVAULT_TOKEN=\"evil\"\n-----END-----";

        let mut cache = CredentialCache::new();
        cache.replace("prod", lines(&[r#"VAULT_TOKEN="real""#]));
        cache.replace("zcerts", vec![EnvVar::new("TLS_CERT", pem).cache_line()]);

        let reparsed = CredentialCache::parse(&cache.serialize());
        assert_eq!(reparsed, cache);
        assert_eq!(reparsed.lines("prod"), Some(lines(&[r#"VAULT_TOKEN="real""#]).as_slice()));

        let vault = VaultClient::new("http://127.0.0.1:1").unwrap();
        let mut provider = SecretMapProvider::new(SecretFlavor::Generic, config, vault);
        provider.load_cached(reparsed.lines("zcerts").unwrap());
        assert!(provider.is_loaded());
        assert_eq!(provider.value("TLS_CERT"), Some(pem));
    }

    #[tokio::test]
    async fn test_generate_copies_mapped_keys_only() {
        let server = secret_server().await;
        let vault = VaultClient::new(&server.uri()).unwrap();
        let mut provider = SecretMapProvider::new(SecretFlavor::OpenStack, openstack_config(), vault);

        provider.generate().await.unwrap();
        assert!(provider.is_loaded());
        assert_eq!(
            provider.cache_lines(),
            lines(&[r#"OS_PASSWORD="hunter2""#, r#"OS_USERNAME="admin""#])
        );
        assert_eq!(provider.export_lines()[1], r#"export OS_USERNAME="admin""#);
    }

    #[tokio::test]
    async fn test_partial_cache_regenerates_everything() {
        let server = secret_server().await;
        let vault = VaultClient::new(&server.uri()).unwrap();
        let mut provider = SecretMapProvider::new(SecretFlavor::OpenStack, openstack_config(), vault);

        provider.load_cached(&lines(&[r#"OS_USERNAME="stale""#]));
        assert!(!provider.is_loaded());
        provider.generate().await.unwrap();

        assert!(provider.is_loaded());
        assert_eq!(provider.value("OS_USERNAME"), Some("admin"));
    }

    #[tokio::test]
    async fn test_generic_missing_secret_leaves_unloaded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let vault = VaultClient::new(&server.uri()).unwrap();
        let mut config = openstack_config();
        config.kind = "secret".to_string();
        config.method = String::new();
        let mut provider = SecretMapProvider::new(SecretFlavor::Generic, config, vault);

        provider.generate().await.unwrap();
        assert!(!provider.is_loaded());
        assert!(provider.vars().is_empty());
    }

    #[tokio::test]
    async fn test_infoblox_requires_secret_method() {
        let vault = VaultClient::new("http://127.0.0.1:1").unwrap();
        let mut config = openstack_config();
        config.method = "role".to_string();
        let mut provider = SecretMapProvider::new(SecretFlavor::Infoblox, config, vault);

        let result = provider.generate().await;
        assert!(matches!(result, Err(ClusterProfileError::AuthMethodUnsupported { .. })));
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let vault = VaultClient::new(&server.uri()).unwrap();
        let mut provider = SecretMapProvider::new(SecretFlavor::OpenStack, openstack_config(), vault);
        let result = provider.generate().await;
        assert!(matches!(result, Err(ClusterProfileError::BackendCallFailed { .. })));
    }
}
