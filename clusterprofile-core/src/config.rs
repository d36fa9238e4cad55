//! Cluster profile definitions.
//!
//! Profiles are declared in YAML files inside a profile folder. Each file holds
//! a list of cluster documents:
//!
//! ```yaml
//! - name: prod
//!   vault:
//!     addr: https://vault.prod:8200
//!     method: oidc
//!   providers:
//!     - type: consul
//!       backend: consul-prod
//!       method: role
//!       addr: https://consul.prod:8501
//!       config:
//!         role: operator
//!     - type: secret
//!       config:
//!         path: secret/openstack/prod
//!         secret_map:
//!           username: OS_USERNAME
//!           password: OS_PASSWORD
//! ```
//!
//! Every `*.yaml` / `*.yml` file in the folder is read; a later definition of
//! the same name replaces an earlier one.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for profile definition loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the profile folder or a file in it.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A profile file is not valid YAML for the expected schema.
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Method-specific parameters shared by the session and every provider.
///
/// Each consumer reads only the fields its method needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodSettings {
    /// Backend role used to mint a lease or a role-scoped token.
    pub role: String,

    /// Statically configured token.
    pub token: String,

    /// Policies attached to a role-scoped token.
    pub policies: Vec<String>,

    /// Secret path read by the secret-map providers.
    pub path: String,

    /// Source key to output variable name.
    ///
    /// For the secret providers the source key is a key of the secret's data;
    /// for the KeePass provider it is an entry title.
    pub secret_map: BTreeMap<String, String>,

    /// Inline `name = value` lines for the text provider.
    pub data: String,

    /// File read by the text and KeePass providers.
    pub file: String,

    /// KeePass database password.
    pub password: String,

    /// Dotted KeePass group path, e.g. `infra.prod`.
    pub group: String,

    /// Interactive login command line, replacing the default
    /// `vault login -method oidc -token-only`.
    pub login_command: Vec<String>,
}

/// Primary session configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub addr: String,
    pub method: String,
    pub config: MethodSettings,

    /// Profile whose session is used to authenticate this one.
    #[serde(rename = "pivoting_profile", skip_serializing_if = "Option::is_none")]
    pub pivot_profile: Option<String>,
}

/// A secondary credential source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Registry tag selecting the provider implementation.
    #[serde(rename = "type")]
    pub kind: String,
    pub backend: String,
    pub method: String,
    pub config: MethodSettings,
    pub addr: String,
}

/// One cluster profile definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(rename = "vault", default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Parse a YAML document holding a list of cluster definitions.
pub fn parse_profiles(content: &str) -> Result<Vec<ClusterConfig>, serde_yaml::Error> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(content)
}

/// Load every profile definition in `folder`, keyed by name.
///
/// A missing folder yields no profiles.
pub fn load_profiles(folder: &Path) -> Result<HashMap<String, ClusterConfig>, ConfigError> {
    let mut profiles = HashMap::new();

    if !folder.exists() {
        tracing::warn!("Profile folder {:?} does not exist", folder);
        return Ok(profiles);
    }

    let entries = fs::read_dir(folder).map_err(|source| ConfigError::Io {
        path: folder.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_yaml(path))
        .collect();
    files.sort();

    for path in files {
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let documents = parse_profiles(&content).map_err(|source| ConfigError::Yaml {
            path: path.clone(),
            source,
        })?;

        tracing::debug!("Loaded {} profiles from {:?}", documents.len(), path);
        for profile in documents {
            if profiles.contains_key(&profile.name) {
                tracing::warn!("Profile {} redefined in {:?}", profile.name, path);
            }
            profiles.insert(profile.name.clone(), profile);
        }
    }

    Ok(profiles)
}

fn is_yaml(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
}
