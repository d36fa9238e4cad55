//! Shell script rendering for loaded profiles.

use anyhow::{Context, Result};
use clusterprofile_core::credential::shell_quote;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Command printed before the export lines, e.g. `"figlet" "prod" && echo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub command: String,
    pub args: Vec<String>,
}

impl Banner {
    /// The banner to render, if enabled and its command is on `PATH`.
    pub fn resolve(enabled: bool, command: &str, args: Vec<String>) -> Option<Self> {
        if !enabled || command.is_empty() {
            return None;
        }
        if find_on_path(command).is_none() {
            tracing::debug!("Banner command {} not found on PATH", command);
            return None;
        }
        Some(Self {
            command: command.to_string(),
            args,
        })
    }

    fn line(&self, profile: &str) -> String {
        let words: Vec<String> = std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .chain(std::iter::once(profile))
            .map(shell_quote)
            .collect();
        format!("{} && echo", words.join(" "))
    }
}

/// Render the script that exports a profile's credentials.
pub fn render_script(profile: &str, export_lines: &[String], banner: Option<&Banner>) -> String {
    let mut script = String::from("#!/bin/bash\n");
    if let Some(banner) = banner {
        script.push_str(&banner.line(profile));
        script.push('\n');
    }
    for line in export_lines {
        script.push_str(line);
        script.push('\n');
    }
    script
}

/// Write the script to `path`, creating parent directories.
///
/// The script carries live credentials, so it is executable and readable by
/// its owner only (mode 0700). An existing file is narrowed to that mode
/// before anything is written to it.
pub fn write_exec_file(path: &Path, script: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o700);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {:?}", path))?;
    }

    file.write_all(script.as_bytes())
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        true
    }
}
