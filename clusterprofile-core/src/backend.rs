//! Secret backend client.
//!
//! A small HTTP client for the parts of the Vault API the session and the
//! providers use:
//! - logical reads (`GET /v1/<path>`)
//! - role-scoped token creation (`POST /v1/auth/token/create/<role>`)
//! - token self-lookup (`GET /v1/auth/token/lookup-self`)
//!
//! Clones share the underlying connection pool. A client carries the token
//! it authenticates with; [`VaultClient::with_token`] derives a client for the
//! same backend under another token.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::secret::Secret;

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Error type for backend calls.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The configured address is not a valid URL.
    #[error("invalid backend address {addr}: {message}")]
    InvalidAddress { addr: String, message: String },

    /// Transport failure.
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with an error status.
    #[error("{url} returned {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    /// The response body did not have the expected shape.
    #[error("unexpected response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

/// Data and lease returned by a logical read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogicalSecret {
    #[serde(default)]
    pub lease_duration: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: BTreeMap<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

impl LogicalSecret {
    /// String values of the secret data.
    ///
    /// KV version 2 responses nest the values under `data.data`; those are
    /// flattened. Non-string values are skipped.
    pub fn string_values(&self) -> BTreeMap<String, String> {
        let source = match (self.data.get("data"), self.data.get("metadata")) {
            (Some(Value::Object(inner)), Some(_)) => inner
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            _ => self.data.clone(),
        };

        source
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::String(s) => Some((key, s)),
                _ => None,
            })
            .collect()
    }

    /// A string field of the secret data.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Token issued by the token auth backend.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenAuth {
    pub client_token: String,
    #[serde(default)]
    pub lease_duration: i64,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    auth: Option<TokenAuth>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    data: LookupData,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    ttl: i64,
}

#[derive(Debug, Serialize)]
struct TokenCreateRequest<'a> {
    policies: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// HTTP client bound to one backend address.
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    base: Url,
    token: Secret,
}

impl VaultClient {
    /// Create a client for `addr` with a fresh connection pool.
    pub fn new(addr: &str) -> Result<Self, BackendError> {
        Self::with_http(reqwest::Client::new(), addr)
    }

    /// Create a client for `addr` sharing an existing connection pool.
    pub fn with_http(http: reqwest::Client, addr: &str) -> Result<Self, BackendError> {
        let mut base = Url::parse(addr).map_err(|e| BackendError::InvalidAddress {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http,
            base,
            token: Secret::default(),
        })
    }

    /// The same backend, authenticated with `token`.
    pub fn with_token(&self, token: Secret) -> Self {
        Self {
            http: self.http.clone(),
            base: self.base.clone(),
            token,
        }
    }

    pub fn set_token(&mut self, token: Secret) {
        self.token = token;
    }

    pub fn token(&self) -> &Secret {
        &self.token
    }

    /// Address the client was created for, without the trailing slash.
    pub fn address(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// The shared connection pool.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Read a logical path. Returns `Ok(None)` when nothing exists there.
    pub async fn read(&self, path: &str) -> Result<Option<LogicalSecret>, BackendError> {
        let url = self.endpoint(path)?;
        tracing::debug!("Reading {}", url);

        let response = self
            .http
            .get(url.clone())
            .header(TOKEN_HEADER, self.token.expose())
            .send()
            .await
            .map_err(|source| BackendError::Http {
                url: url.to_string(),
                source,
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(&url, response).await?;
        let secret = response
            .json::<LogicalSecret>()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Some(secret))
    }

    /// Create a token against a token role.
    pub async fn create_token_with_role(
        &self,
        role: &str,
        policies: &[String],
    ) -> Result<TokenAuth, BackendError> {
        let url = self.endpoint(&format!("auth/token/create/{}", role))?;
        tracing::debug!("Creating token with role {}", role);

        let response = self
            .http
            .post(url.clone())
            .header(TOKEN_HEADER, self.token.expose())
            .json(&TokenCreateRequest { policies })
            .send()
            .await
            .map_err(|source| BackendError::Http {
                url: url.to_string(),
                source,
            })?;

        let response = check_status(&url, response).await?;
        let body = response
            .json::<AuthResponse>()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        body.auth.ok_or_else(|| BackendError::InvalidResponse {
            url: url.to_string(),
            message: "response carries no auth block".to_string(),
        })
    }

    /// Remaining TTL of the client's own token, in seconds.
    pub async fn lookup_self_ttl(&self) -> Result<i64, BackendError> {
        let url = self.endpoint("auth/token/lookup-self")?;

        let response = self
            .http
            .get(url.clone())
            .header(TOKEN_HEADER, self.token.expose())
            .send()
            .await
            .map_err(|source| BackendError::Http {
                url: url.to_string(),
                source,
            })?;

        let response = check_status(&url, response).await?;
        let body = response
            .json::<LookupResponse>()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(body.data.ttl)
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        let relative = format!("v1/{}", path.trim_start_matches('/'));
        self.base
            .join(&relative)
            .map_err(|e| BackendError::InvalidAddress {
                addr: self.base.to_string(),
                message: e.to_string(),
            })
    }
}

async fn check_status(url: &Url, response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .filter(|body| !body.errors.is_empty())
        .map(|body| body.errors.join("; "))
        .unwrap_or(text);

    Err(BackendError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        message,
    })
}
