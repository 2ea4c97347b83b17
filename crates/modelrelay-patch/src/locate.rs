use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const EXTENSION_GLOB: &str = "extensions/github.copilot-chat-*/dist";
const SERVER_ROOTS: &[&str] = &[".vscode-server", ".vscode-remote"];
const DESKTOP_ROOT: &str = ".vscode";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleFile {
    /// Primary bundle carrying the model-request code.
    Cli,
    /// Only ever patched by the retired scheme.
    Extension,
}

impl BundleFile {
    pub fn file_name(self) -> &'static str {
        match self {
            BundleFile::Cli => "cli.js",
            BundleFile::Extension => "extension.js",
        }
    }
}

fn roots(env: Environment) -> Vec<&'static str> {
    let mut roots = SERVER_ROOTS.to_vec();
    if env == Environment::Local {
        roots.push(DESKTOP_ROOT);
    }
    roots
}

/// Glob patterns under `home`, with `home` escaped so its own characters never
/// act as wildcards.
pub fn search_patterns(home: &Path, env: Environment, file: BundleFile) -> Vec<String> {
    let home = glob::Pattern::escape(&home.to_string_lossy());
    roots(env)
        .into_iter()
        .map(|root| format!("{home}/{root}/{EXTENSION_GLOB}/{}", file.file_name()))
        .collect()
}

/// `~/`-relative patterns for a shell on another machine to expand.
pub fn relative_patterns(env: Environment, file: BundleFile) -> Vec<String> {
    roots(env)
        .into_iter()
        .map(|root| format!("~/{root}/{EXTENSION_GLOB}/{}", file.file_name()))
        .collect()
}

/// Finds the installed copy of `file`. Matches from every root are pooled and
/// the greatest path string wins, the same rule the remote `sort | tail`
/// applies.
pub fn locate(home: &Path, env: Environment, file: BundleFile) -> Result<PathBuf> {
    let mut found = Vec::new();
    for pattern in search_patterns(home, env, file) {
        let entries = match glob::glob(&pattern) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%pattern, error = %err, "skipping invalid search pattern");
                continue;
            }
        };
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => found.push(path),
                Ok(_) => {}
                Err(err) => debug!(error = %err, "unreadable path while searching"),
            }
        }
    }

    found.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
    let newest = found.pop().ok_or_else(|| {
        Error::NotFound(format!(
            "{} not found under {}",
            file.file_name(),
            home.display()
        ))
    })?;
    debug!(path = %newest.display(), candidates = found.len() + 1, "located bundle");
    Ok(newest)
}
