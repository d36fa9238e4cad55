//! Static variables from inline text or a local file.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::CredentialProvider;
use crate::config::ProviderConfig;
use crate::credential::EnvVar;
use crate::error::{ClusterProfileError, Result};

static TEXT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$")
        .expect("text line pattern is valid")
});

/// Parse `name = value` lines.
///
/// Blank lines and `#` comments are skipped, surrounding quotes are removed
/// from values, and a repeated name keeps its last value at its first
/// position.
pub fn parse_text(content: &str) -> Vec<EnvVar> {
    let mut vars: Vec<EnvVar> = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(captures) = TEXT_LINE.captures(trimmed) else {
            tracing::debug!("Skipping unparseable text line");
            continue;
        };
        let var = EnvVar::new(&captures[1], unquote(&captures[2]));
        match vars.iter_mut().find(|existing| existing.name == var.name) {
            Some(existing) => existing.value = var.value,
            None => vars.push(var),
        }
    }
    vars
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Variables that are always read from configuration.
///
/// Methods:
/// - `data`: parse the inline `data` setting
/// - `file`: parse the file named by the `file` setting
///
/// There is no expiry, so cached lines are never reused.
pub struct TextProvider {
    config: ProviderConfig,
    vars: Vec<EnvVar>,
    generated: bool,
}

impl TextProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            vars: Vec::new(),
            generated: false,
        }
    }
}

#[async_trait]
impl CredentialProvider for TextProvider {
    fn kind(&self) -> &str {
        "text"
    }

    fn load_cached(&mut self, _lines: &[String]) {}

    async fn generate(&mut self) -> Result<()> {
        let content = match self.config.method.as_str() {
            "data" => self.config.config.data.clone(),
            "file" => {
                let path = &self.config.config.file;
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ClusterProfileError::Io {
                        path: path.clone(),
                        source,
                    })?
            }
            other => return Err(ClusterProfileError::unsupported("text provider", other)),
        };

        self.vars = parse_text(&content);
        self.generated = true;
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.generated
    }

    fn vars(&self) -> Vec<EnvVar> {
        self.vars.clone()
    }
}
