//! KeePass database provider.
//!
//! Entries are selected from a group given as a dotted path below the root
//! group (`infra.prod` is the `prod` group inside `infra`); an empty path
//! selects the root group itself. `secret_map` maps entry titles to output
//! variables, and each variable receives the entry's password.
//!
//! Decoding is done by the `keepass` crate (feature `kdbx`) and converted into
//! the plain [`EntryGroup`] tree the provider works on.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::CredentialProvider;
use crate::config::ProviderConfig;
use crate::credential::{parse_assignment, EnvVar};
use crate::error::{ClusterProfileError, Result};

/// A decoded group: entry titles with their passwords, plus child groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryGroup {
    pub name: String,
    pub entries: Vec<(String, String)>,
    pub groups: Vec<EntryGroup>,
}

impl EntryGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_entry(mut self, title: impl Into<String>, password: impl Into<String>) -> Self {
        self.entries.push((title.into(), password.into()));
        self
    }

    pub fn with_group(mut self, group: EntryGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Follow a dotted path of child group names.
    ///
    /// Every segment must match; an empty path is this group.
    pub fn find(&self, path: &str) -> Option<&EntryGroup> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |group, segment| {
            group.groups.iter().find(|child| child.name == segment)
        })
    }
}

/// Credentials read from a local KeePass database.
pub struct KeePassProvider {
    config: ProviderConfig,
    root: Option<EntryGroup>,
    values: BTreeMap<String, String>,
}

impl KeePassProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            root: None,
            values: BTreeMap::new(),
        }
    }

    /// A provider over an already decoded tree.
    pub fn with_root(config: ProviderConfig, root: EntryGroup) -> Self {
        Self {
            config,
            root: Some(root),
            values: BTreeMap::new(),
        }
    }

    fn outputs(&self) -> impl Iterator<Item = &String> {
        self.config.config.secret_map.values()
    }

    async fn open_root(&self) -> Result<EntryGroup> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }

        let path = self.config.config.file.clone();
        let password = self.config.config.password.clone();
        let decode_path = path.clone();
        tokio::task::spawn_blocking(move || decode_database(&decode_path, &password))
            .await
            .map_err(|e| ClusterProfileError::Database {
                path,
                message: e.to_string(),
            })?
    }
}

#[async_trait]
impl CredentialProvider for KeePassProvider {
    fn kind(&self) -> &str {
        "keepass"
    }

    fn load_cached(&mut self, lines: &[String]) {
        for var in lines.iter().filter_map(|line| parse_assignment(line)) {
            if self.outputs().any(|name| *name == var.name) {
                self.values.insert(var.name, var.value);
            }
        }
    }

    async fn generate(&mut self) -> Result<()> {
        let root = self.open_root().await?;
        let group_path = self.config.config.group.as_str();

        let Some(group) = root.find(group_path) else {
            tracing::warn!(
                "KeePass group {:?} not found in {}",
                group_path,
                self.config.config.file
            );
            return Ok(());
        };

        for (title, password) in &group.entries {
            if let Some(var) = self.config.config.secret_map.get(title) {
                self.values.insert(var.clone(), password.clone());
            }
        }
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.outputs().all(|var| self.values.contains_key(var))
    }

    fn vars(&self) -> Vec<EnvVar> {
        self.outputs()
            .filter_map(|var| self.values.get(var).map(|value| EnvVar::new(var, value)))
            .collect()
    }
}

#[cfg(feature = "kdbx")]
fn decode_database(path: &str, password: &str) -> Result<EntryGroup> {
    use keepass::{Database, DatabaseKey};

    let mut file = std::fs::File::open(path).map_err(|source| ClusterProfileError::Io {
        path: path.to_string(),
        source,
    })?;
    let key = DatabaseKey::new().with_password(password);
    let db = Database::open(&mut file, key).map_err(|e| ClusterProfileError::Database {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    tracing::debug!("Decoded KeePass database {}", path);
    Ok(convert_group(&db.root))
}

#[cfg(feature = "kdbx")]
fn convert_group(group: &keepass::db::Group) -> EntryGroup {
    use keepass::db::Node;

    let mut converted = EntryGroup::new(group.name.clone());
    for node in &group.children {
        match node {
            Node::Group(child) => converted.groups.push(convert_group(child)),
            Node::Entry(entry) => {
                if let Some(title) = entry.get_title() {
                    let password = entry.get_password().unwrap_or_default();
                    converted.entries.push((title.to_string(), password.to_string()));
                }
            }
        }
    }
    converted
}

#[cfg(not(feature = "kdbx"))]
fn decode_database(path: &str, _password: &str) -> Result<EntryGroup> {
    Err(ClusterProfileError::Database {
        path: path.to_string(),
        message: "built without KeePass support (feature `kdbx`)".to_string(),
    })
}
