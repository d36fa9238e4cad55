//! Lease-based providers (Consul and Nomad secrets engines).

use async_trait::async_trait;

use super::CredentialProvider;
use crate::backend::VaultClient;
use crate::config::ProviderConfig;
use crate::credential::{EnvVar, Lease};
use crate::error::{ClusterProfileError, Result};

/// Variable names and response key for one lease-issuing secrets engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseFlavor {
    pub kind: &'static str,
    pub token_var: &'static str,
    pub ttl_var: &'static str,
    pub addr_var: &'static str,
    /// Key of the issued token in the `<backend>/creds/<role>` response.
    pub token_key: &'static str,
}

impl LeaseFlavor {
    pub const CONSUL: LeaseFlavor = LeaseFlavor {
        kind: "consul",
        token_var: "CONSUL_HTTP_TOKEN",
        ttl_var: "CONSUL_TTL",
        addr_var: "CONSUL_HTTP_ADDR",
        token_key: "token",
    };

    pub const NOMAD: LeaseFlavor = LeaseFlavor {
        kind: "nomad",
        token_var: "NOMAD_TOKEN",
        ttl_var: "NOMAD_TTL",
        addr_var: "NOMAD_ADDR",
        token_key: "secret_id",
    };
}

/// Token provider backed by a secrets-engine lease or a static token.
///
/// Methods:
/// - `role`: read `<backend>/creds/<role>`; the lease expires after the
///   returned lease duration
/// - `token`: use the configured token verbatim, without expiry
pub struct LeaseProvider {
    flavor: LeaseFlavor,
    config: ProviderConfig,
    vault: VaultClient,
    lease: Lease,
}

impl LeaseProvider {
    pub fn new(flavor: LeaseFlavor, config: ProviderConfig, vault: VaultClient) -> Self {
        Self {
            flavor,
            config,
            vault,
            lease: Lease::default(),
        }
    }

    /// The lease currently held.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    async fn lease_from_role(&mut self) -> Result<()> {
        if self.lease.is_valid() {
            return Ok(());
        }

        let path = format!("{}/creds/{}", self.config.backend, self.config.config.role);
        let operation = format!("{} lease {}", self.flavor.kind, path);
        let secret = self
            .vault
            .read(&path)
            .await
            .map_err(|e| ClusterProfileError::backend(&operation, e))?
            .ok_or_else(|| ClusterProfileError::MissingCredential {
                operation: operation.clone(),
                message: "no secret at path".to_string(),
            })?;

        let token = secret.string(self.flavor.token_key).ok_or_else(|| {
            ClusterProfileError::MissingCredential {
                operation: operation.clone(),
                message: format!("response has no {} field", self.flavor.token_key),
            }
        })?;

        self.lease = Lease::issued_now(token, secret.lease_duration).ok_or_else(|| {
            ClusterProfileError::lease_out_of_range(
                &operation,
                self.vault.address(),
                secret.lease_duration,
            )
        })?;
        tracing::info!(
            "Issued {} lease for role {} ({}s)",
            self.flavor.kind,
            self.config.config.role,
            secret.lease_duration
        );
        Ok(())
    }

    fn lease_from_token(&mut self) {
        if self.config.config.token.is_empty() {
            tracing::warn!("{} provider has method token but no token configured", self.flavor.kind);
        }
        self.lease = Lease::unbounded(self.config.config.token.clone());
    }
}

#[async_trait]
impl CredentialProvider for LeaseProvider {
    fn kind(&self) -> &str {
        self.flavor.kind
    }

    fn load_cached(&mut self, lines: &[String]) {
        if let Some(lease) = Lease::from_cached(lines, self.flavor.token_var, self.flavor.ttl_var) {
            tracing::debug!("Reusing cached {} token", self.flavor.kind);
            self.lease = lease;
        }
    }

    async fn generate(&mut self) -> Result<()> {
        match self.config.method.as_str() {
            "role" => self.lease_from_role().await,
            "token" => {
                self.lease_from_token();
                Ok(())
            }
            other => Err(ClusterProfileError::unsupported(
                format!("{} provider", self.flavor.kind),
                other,
            )),
        }
    }

    fn is_loaded(&self) -> bool {
        self.lease.is_valid()
    }

    fn vars(&self) -> Vec<EnvVar> {
        self.lease.vars(
            self.flavor.token_var,
            self.flavor.ttl_var,
            self.flavor.addr_var,
            &self.config.addr,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::format_ttl;
    use crate::secret::Secret;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn role_config(backend: &str, role: &str) -> ProviderConfig {
        let mut config = ProviderConfig {
            kind: "consul".to_string(),
            backend: backend.to_string(),
            method: "role".to_string(),
            addr: "https://consul:8501".to_string(),
            ..Default::default()
        };
        config.config.role = role.to_string();
        config
    }

    fn cached(token: &str, ttl: chrono::DateTime<Utc>) -> Vec<String> {
        vec![
            format!(r#"CONSUL_HTTP_TOKEN="{}""#, token),
            format!(r#"CONSUL_TTL="{}""#, format_ttl(ttl)),
            r#"CONSUL_HTTP_ADDR="https://consul:8501""#.to_string(),
        ]
    }

    async fn lease_server(token_key: &str, token: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/consul/creds/ops"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "lease_duration": 3600,
                "data": {token_key: token}
            })))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_role_lease_issued() {
        let server = lease_server("token", "consul-token").await;
        let vault = VaultClient::new(&server.uri()).unwrap().with_token(Secret::new("root"));
        let mut provider = LeaseProvider::new(LeaseFlavor::CONSUL, role_config("consul", "ops"), vault);

        provider.load_cached(&[]);
        assert!(!provider.is_loaded());
        provider.generate().await.unwrap();
        assert!(provider.is_loaded());

        let lines = provider.cache_lines();
        assert_eq!(lines[0], r#"CONSUL_HTTP_TOKEN="consul-token""#);
        assert!(lines[1].starts_with("CONSUL_TTL=\""));
        assert_eq!(lines[2], r#"CONSUL_HTTP_ADDR="https://consul:8501""#);
        assert_eq!(provider.export_lines()[0], r#"export CONSUL_HTTP_TOKEN="consul-token""#);

        // A held lease is not requested twice.
        provider.generate().await.unwrap();
    }

    #[tokio::test]
    async fn test_nomad_uses_secret_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/nomad/creds/dev"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "lease_duration": 60,
                "data": {"accessor_id": "a", "secret_id": "nomad-secret"}
            })))
            .mount(&server)
            .await;

        let vault = VaultClient::new(&server.uri()).unwrap();
        let mut config = role_config("nomad", "dev");
        config.kind = "nomad".to_string();
        let mut provider = LeaseProvider::new(LeaseFlavor::NOMAD, config, vault);
        provider.generate().await.unwrap();

        assert_eq!(provider.lease().token.expose(), "nomad-secret");
        assert!(provider.cache_lines()[0].starts_with("NOMAD_TOKEN="));
    }

    #[tokio::test]
    async fn test_valid_cache_skips_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let vault = VaultClient::new(&server.uri()).unwrap();
        let mut provider = LeaseProvider::new(LeaseFlavor::CONSUL, role_config("consul", "ops"), vault);
        provider.load_cached(&cached("cached-token", Utc::now() + Duration::hours(1)));

        assert!(provider.is_loaded());
        assert_eq!(provider.lease().token.expose(), "cached-token");
    }

    #[tokio::test]
    async fn test_expired_cache_regenerates() {
        let server = lease_server("token", "fresh-token").await;
        let vault = VaultClient::new(&server.uri()).unwrap();
        let mut provider = LeaseProvider::new(LeaseFlavor::CONSUL, role_config("consul", "ops"), vault);

        provider.load_cached(&cached("stale-token", Utc::now() - Duration::seconds(1)));
        assert!(!provider.is_loaded());

        provider.generate().await.unwrap();
        assert_eq!(provider.lease().token.expose(), "fresh-token");
    }

    #[tokio::test]
    async fn test_static_token_method() {
        let mut config = role_config("consul", "ops");
        config.method = "token".to_string();
        config.config.token = "static-token".to_string();
        let vault = VaultClient::new("http://127.0.0.1:1").unwrap();
        let mut provider = LeaseProvider::new(LeaseFlavor::CONSUL, config, vault);

        provider.generate().await.unwrap();
        assert!(provider.is_loaded());
        assert_eq!(provider.lease().expires_at, None);
        assert_eq!(provider.cache_lines()[1], r#"CONSUL_TTL="""#);
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let mut config = role_config("consul", "ops");
        config.method = "approle".to_string();
        let vault = VaultClient::new("http://127.0.0.1:1").unwrap();
        let mut provider = LeaseProvider::new(LeaseFlavor::CONSUL, config, vault);

        let result = provider.generate().await;
        assert!(matches!(result, Err(ClusterProfileError::AuthMethodUnsupported { .. })));
    }

    #[tokio::test]
    async fn test_unrepresentable_lease_duration_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/consul/creds/ops"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "lease_duration": i64::MAX,
                "data": {"token": "consul-token"}
            })))
            .mount(&server)
            .await;

        let vault = VaultClient::new(&server.uri()).unwrap();
        let mut provider = LeaseProvider::new(LeaseFlavor::CONSUL, role_config("consul", "ops"), vault);
        let result = provider.generate().await;

        assert!(matches!(result, Err(ClusterProfileError::BackendCallFailed { .. })));
        assert!(!provider.is_loaded());
    }

    #[tokio::test]
    async fn test_missing_lease_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let vault = VaultClient::new(&server.uri()).unwrap();
        let mut provider = LeaseProvider::new(LeaseFlavor::CONSUL, role_config("consul", "ops"), vault);
        let result = provider.generate().await;
        assert!(matches!(result, Err(ClusterProfileError::MissingCredential { .. })));
    }
}
