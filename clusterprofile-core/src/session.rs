//! Primary session management.
//!
//! The primary session is the authenticated backend context every other
//! credential of a profile is derived from. A session starts
//! [`Unauthenticated`](SessionState::Unauthenticated) and becomes usable in
//! one of three ways:
//! - reusing a cached `VAULT_TOKEN` whose `VAULT_TTL` is still in the future
//! - authenticating directly with its configured method
//! - delegating through a pivot session's token
//!
//! # Methods
//!
//! - `oidc` (alias `interactive`): runs `vault login -method oidc -token-only`
//!   (or the configured `login_command`) with `VAULT_ADDR` set, reads the
//!   token from stdout and looks up its TTL. The command blocks until the
//!   user finishes the login; there is no timeout.
//! - `token`: with a `role`, creates a role-scoped token carrying the
//!   configured `policies` (authenticated by the configured `token`, if any);
//!   without a role, uses the configured `token` verbatim.

use std::process::Stdio;

use crate::backend::VaultClient;
use crate::config::SessionConfig;
use crate::credential::{self, EnvVar, Lease};
use crate::error::{ClusterProfileError, Result};
use crate::secret::Secret;

pub const TOKEN_VAR: &str = "VAULT_TOKEN";
pub const TTL_VAR: &str = "VAULT_TTL";
pub const ADDR_VAR: &str = "VAULT_ADDR";

/// Variables owned by the primary session inside a cache entry.
pub const SESSION_VARS: [&str; 3] = [TOKEN_VAR, TTL_VAR, ADDR_VAR];

const DEFAULT_ADDR: &str = "https://127.0.0.1:8200";
const DEFAULT_LOGIN_COMMAND: [&str; 5] = ["vault", "login", "-method", "oidc", "-token-only"];

/// Where a session's token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    /// Reused from the cache or obtained with the session's own method.
    Authenticated,
    /// Obtained through a pivot session's token.
    Delegated,
}

/// Authenticated (or not yet authenticated) backend session for a profile.
pub struct PrimarySession {
    profile: String,
    config: SessionConfig,
    client: VaultClient,
    lease: Lease,
    state: SessionState,
}

impl PrimarySession {
    /// Bind a session to its address and method. The token starts empty.
    ///
    /// An empty address falls back to the `VAULT_ADDR` environment variable,
    /// then to `https://127.0.0.1:8200`.
    pub fn new(
        profile: impl Into<String>,
        config: SessionConfig,
        http: reqwest::Client,
    ) -> Result<Self> {
        let profile = profile.into();
        let addr = resolve_address(&config.addr);
        let client = VaultClient::with_http(http, &addr)
            .map_err(|e| ClusterProfileError::backend(format!("session for {}", profile), e))?;

        Ok(Self {
            profile,
            config,
            client,
            lease: Lease::default(),
            state: SessionState::Unauthenticated,
        })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Name of the profile this session delegates through, if any.
    pub fn pivot_profile(&self) -> Option<&str> {
        self.config.pivot_profile.as_deref().filter(|p| !p.is_empty())
    }

    /// A backend client authenticated with this session's token.
    pub fn client(&self) -> VaultClient {
        self.client.with_token(self.lease.token.clone())
    }

    /// Reuse cached credentials if their TTL is still in the future.
    pub fn load_cached(&mut self, lines: &[String]) -> bool {
        match Lease::from_cached(lines, TOKEN_VAR, TTL_VAR) {
            Some(lease) => {
                tracing::debug!("Reusing cached session for {}", self.profile);
                self.adopt(lease, SessionState::Authenticated);
                true
            }
            None => false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state != SessionState::Unauthenticated && self.lease.is_valid()
    }

    /// Authenticate with the configured method.
    ///
    /// Does nothing when a valid token is already held.
    pub async fn authenticate(&mut self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        match self.config.method.as_str() {
            "oidc" | "interactive" => {
                if self.lease.is_empty() {
                    self.login_interactive().await?;
                }
                Ok(())
            }
            "token" => self.login_token().await,
            other => Err(ClusterProfileError::unsupported(
                format!("session for {}", self.profile),
                other,
            )),
        }
    }

    /// Authenticate using a pivot session's lease.
    ///
    /// With a configured role, a role-scoped token is created on this
    /// session's backend using the pivot token. Without one, the pivot lease
    /// is used as is.
    pub async fn authenticate_delegated(&mut self, pivot: &Lease) -> Result<()> {
        if !pivot.is_valid() {
            return Err(ClusterProfileError::MissingCredential {
                operation: format!("pivot for {}", self.profile),
                message: "pivot session holds no valid token".to_string(),
            });
        }

        let role = self.config.config.role.clone();
        if role.is_empty() {
            self.adopt(pivot.clone(), SessionState::Delegated);
            return Ok(());
        }

        let delegated = self.client.with_token(pivot.token.clone());
        let lease = create_role_token(&delegated, &role, &self.config.config.policies).await?;
        tracing::info!("Created delegated token for {} with role {}", self.profile, role);
        self.adopt(lease, SessionState::Delegated);
        Ok(())
    }

    async fn login_token(&mut self) -> Result<()> {
        let settings = &self.config.config;
        if !settings.role.is_empty() {
            let parent = self.client.with_token(Secret::new(settings.token.clone()));
            let lease = create_role_token(&parent, &settings.role, &settings.policies).await?;
            tracing::info!("Created token for {} with role {}", self.profile, settings.role);
            self.adopt(lease, SessionState::Authenticated);
            Ok(())
        } else if !settings.token.is_empty() {
            let lease = Lease::unbounded(settings.token.clone());
            self.adopt(lease, SessionState::Authenticated);
            Ok(())
        } else {
            Err(ClusterProfileError::MissingCredential {
                operation: format!("token login for {}", self.profile),
                message: "method token needs a role or a token".to_string(),
            })
        }
    }

    async fn login_interactive(&mut self) -> Result<()> {
        let command: Vec<String> = if self.config.config.login_command.is_empty() {
            DEFAULT_LOGIN_COMMAND.iter().map(|s| s.to_string()).collect()
        } else {
            self.config.config.login_command.clone()
        };
        let Some((program, args)) = command.split_first() else {
            return Err(ClusterProfileError::LoginFailed {
                message: "empty login command".to_string(),
            });
        };

        tracing::info!("Starting interactive login for {} via {}", self.profile, program);
        let output = tokio::process::Command::new(program)
            .args(args)
            .env("VAULT_ADDR", self.client.address())
            .stdin(Stdio::inherit())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|e| ClusterProfileError::LoginFailed {
                message: format!("could not run {}: {}", program, e),
            })?;

        if !output.status.success() {
            return Err(ClusterProfileError::LoginFailed {
                message: format!("{} exited with {}", program, output.status),
            });
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(ClusterProfileError::LoginFailed {
                message: format!("{} printed no token", program),
            });
        }

        let authenticated = self.client.with_token(Secret::new(token.clone()));
        let ttl = authenticated.lookup_self_ttl().await.map_err(|e| {
            ClusterProfileError::backend(format!("token lookup for {}", self.profile), e)
        })?;

        let lease = Lease::issued_now(token, ttl).ok_or_else(|| {
            ClusterProfileError::lease_out_of_range(
                format!("token lookup for {}", self.profile),
                authenticated.address(),
                ttl,
            )
        })?;
        self.adopt(lease, SessionState::Authenticated);
        Ok(())
    }

    fn adopt(&mut self, lease: Lease, state: SessionState) {
        self.client.set_token(lease.token.clone());
        self.lease = lease;
        self.state = state;
    }

    /// Token, TTL and address variables.
    pub fn vars(&self) -> Vec<EnvVar> {
        self.lease
            .vars(TOKEN_VAR, TTL_VAR, ADDR_VAR, self.client.address())
    }

    pub fn export_lines(&self) -> Vec<String> {
        credential::export_lines(&self.vars())
    }

    pub fn cache_lines(&self) -> Vec<String> {
        credential::cache_lines(&self.vars())
    }
}

async fn create_role_token(client: &VaultClient, role: &str, policies: &[String]) -> Result<Lease> {
    let auth = client
        .create_token_with_role(role, policies)
        .await
        .map_err(|e| ClusterProfileError::backend(format!("token creation with role {}", role), e))?;
    let lease_duration = auth.lease_duration;
    Lease::issued_now(auth.client_token, lease_duration).ok_or_else(|| {
        ClusterProfileError::lease_out_of_range(
            format!("token creation with role {}", role),
            client.address(),
            lease_duration,
        )
    })
}

fn resolve_address(addr: &str) -> String {
    if !addr.is_empty() {
        return addr.to_string();
    }
    std::env::var("VAULT_ADDR")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::format_ttl;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn token_config(addr: &str, role: &str, token: &str) -> SessionConfig {
        let mut config = SessionConfig {
            addr: addr.to_string(),
            method: "token".to_string(),
            ..Default::default()
        };
        config.config.role = role.to_string();
        config.config.token = token.to_string();
        config
    }

    fn session(config: SessionConfig) -> PrimarySession {
        PrimarySession::new("prod", config, reqwest::Client::new()).unwrap()
    }

    fn cached(ttl: chrono::DateTime<Utc>) -> Vec<String> {
        vec![
            r#"CLUSTERID_PROFILE="prod""#.to_string(),
            r#"VAULT_TOKEN="cached-token""#.to_string(),
            format!(r#"VAULT_TTL="{}""#, format_ttl(ttl)),
        ]
    }

    #[test]
    fn test_new_session_is_unauthenticated() {
        let session = session(token_config("https://vault:8200", "", "t"));
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(session.lease().is_empty());
        assert!(!session.is_loaded());
        assert_eq!(session.pivot_profile(), None);
    }

    #[test]
    fn test_load_cached_respects_ttl() {
        let mut fresh = session(token_config("https://vault:8200", "", ""));
        assert!(fresh.load_cached(&cached(Utc::now() + Duration::hours(1))));
        assert_eq!(fresh.state(), SessionState::Authenticated);
        assert_eq!(fresh.client().token().expose(), "cached-token");

        let mut stale = session(token_config("https://vault:8200", "", ""));
        assert!(!stale.load_cached(&cached(Utc::now() - Duration::seconds(1))));
        assert_eq!(stale.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_static_token() {
        let mut session = session(token_config("https://vault:8200", "", "s.static"));
        session.authenticate().await.unwrap();

        assert!(session.is_loaded());
        assert_eq!(
            session.cache_lines(),
            vec![
                r#"VAULT_TOKEN="s.static""#.to_string(),
                r#"VAULT_TTL="""#.to_string(),
                r#"VAULT_ADDR="https://vault:8200""#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_role_token_minted_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/create/ops"))
            .and(header("X-Vault-Token", "parent"))
            .and(body_json(json!({"policies": ["read"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "auth": {"client_token": "hvs.ops", "lease_duration": 3600}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = token_config(&server.uri(), "ops", "parent");
        config.config.policies = vec!["read".to_string()];
        let mut session = session(config);

        session.authenticate().await.unwrap();
        session.authenticate().await.unwrap();

        assert_eq!(session.lease().token.expose(), "hvs.ops");
        assert!(session.lease().expires_at.unwrap() > Utc::now() + Duration::minutes(59));
        assert_eq!(session.export_lines()[0], r#"export VAULT_TOKEN="hvs.ops""#);
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({"errors": ["denied"]})))
            .mount(&server)
            .await;

        let mut session = session(token_config(&server.uri(), "ops", ""));
        let result = session.authenticate().await;
        assert!(matches!(result, Err(ClusterProfileError::BackendCallFailed { .. })));
        assert!(!session.is_loaded());
    }

    #[tokio::test]
    async fn test_token_method_without_role_or_token() {
        let mut session = session(token_config("https://vault:8200", "", ""));
        let result = session.authenticate().await;
        assert!(matches!(result, Err(ClusterProfileError::MissingCredential { .. })));
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let mut config = token_config("https://vault:8200", "", "");
        config.method = "userpass".to_string();
        let mut session = session(config);

        let result = session.authenticate().await;
        assert!(matches!(result, Err(ClusterProfileError::AuthMethodUnsupported { .. })));
    }

    #[tokio::test]
    async fn test_delegated_with_role_uses_pivot_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/token/create/edge-admin"))
            .and(header("X-Vault-Token", "hub-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "auth": {"client_token": "edge-token", "lease_duration": 600}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut session = session(token_config(&server.uri(), "edge-admin", ""));
        session
            .authenticate_delegated(&Lease::issued_now("hub-token", 3600).unwrap())
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Delegated);
        assert_eq!(session.lease().token.expose(), "edge-token");
    }

    #[tokio::test]
    async fn test_delegated_without_role_adopts_pivot() {
        let mut session = session(token_config("https://vault:8200", "", ""));
        let pivot = Lease::issued_now("hub-token", 3600).unwrap();
        session.authenticate_delegated(&pivot).await.unwrap();

        assert_eq!(session.lease(), &pivot);
    }

    #[tokio::test]
    async fn test_delegated_rejects_empty_pivot() {
        let mut session = session(token_config("https://vault:8200", "ops", ""));
        let result = session.authenticate_delegated(&Lease::default()).await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interactive_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/auth/token/lookup-self"))
            .and(header("X-Vault-Token", "hvs.oidc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"ttl": 900}})))
            .mount(&server)
            .await;

        let mut config = SessionConfig {
            addr: server.uri(),
            method: "oidc".to_string(),
            ..Default::default()
        };
        config.config.login_command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo hvs.oidc".to_string(),
        ];
        let mut session = session(config);
        session.authenticate().await.unwrap();

        assert_eq!(session.lease().token.expose(), "hvs.oidc");
        assert!(session.is_loaded());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interactive_login_failure_aborts() {
        let mut config = SessionConfig {
            addr: "https://vault:8200".to_string(),
            method: "interactive".to_string(),
            ..Default::default()
        };
        config.config.login_command = vec!["sh".to_string(), "-c".to_string(), "exit 2".to_string()];
        let mut session = session(config);

        let result = session.authenticate().await;
        assert!(matches!(result, Err(ClusterProfileError::LoginFailed { .. })));
    }
}
