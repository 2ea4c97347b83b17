use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

mod secret;

pub use secret::{MASKED_KEY_PLACEHOLDER, is_masked_key, mask_api_key, resolve_incoming_key};

pub const LOCAL_TARGET: &str = "local";
pub const CONFIG_PATH_ENV: &str = "MODELRELAY_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "remote-shell", alias = "ssh")]
    RemoteShell,
    #[serde(rename = "remote-codespace", alias = "codespace")]
    RemoteCodespace,
}

impl TargetKind {
    pub fn is_remote(self) -> bool {
        !matches!(self, TargetKind::Local)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Local => "local",
            TargetKind::RemoteShell => "remote-shell",
            TargetKind::RemoteCodespace => "remote-codespace",
        }
    }
}

pub fn parse_target_kind(input: &str) -> Option<TargetKind> {
    match input.trim().to_ascii_lowercase().as_str() {
        "local" => Some(TargetKind::Local),
        "remote-shell" | "ssh" => Some(TargetKind::RemoteShell),
        "remote-codespace" | "codespace" => Some(TargetKind::RemoteCodespace),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Target {
    pub fn local() -> Self {
        Self {
            name: LOCAL_TARGET.to_string(),
            kind: TargetKind::Local,
            host: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMapping {
    pub vscode_id: String,
    pub relay_id: String,
}

/// An auxiliary tool server exposed to the agent through its settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub model_mappings: Vec<ModelMapping>,
    pub default_opus_model: String,
    pub default_sonnet_model: String,
    pub default_haiku_model: String,
    pub mcp_servers: Vec<McpServer>,
    pub targets: Vec<Target>,
    pub auto_detect: bool,
}

impl Default for Config {
    fn default() -> Self {
        let mapping = |vscode_id: &str, relay_id: &str| ModelMapping {
            vscode_id: vscode_id.to_string(),
            relay_id: relay_id.to_string(),
        };
        let server = |name: &str, command: &str, args: &[&str]| McpServer {
            name: name.to_string(),
            enabled: true,
            command: command.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        };

        Self {
            api_key: String::new(),
            base_url: "https://api.anthropic.com".to_string(),
            model_mappings: vec![
                mapping("claude-opus-4.6", "claude-opus-4-6"),
                mapping("claude-sonnet-4.5", "claude-sonnet-4-5-20250929"),
                mapping("claude-haiku-4.5", "claude-haiku-4-5-20251001"),
            ],
            default_opus_model: "claude-opus-4-6".to_string(),
            default_sonnet_model: "claude-sonnet-4-5-20250929".to_string(),
            default_haiku_model: "claude-haiku-4-5-20251001".to_string(),
            mcp_servers: vec![
                server("fetch", "uvx", &["mcp-server-fetch"]),
                server("deepwiki", "npx", &["-y", "mcp-deepwiki@latest"]),
            ],
            targets: vec![Target::local()],
            auto_detect: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("{0}")]
    Invalid(String),
    #[error("target already exists: {0}")]
    Duplicate(String),
    #[error("target not found: {0}")]
    NotFound(String),
    #[error("cannot delete {0} target")]
    Protected(String),
}

impl Config {
    pub fn find_target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|target| target.name == name)
    }

    pub fn add_target(&mut self, target: Target) -> Result<(), TargetError> {
        if target.name.trim().is_empty() {
            return Err(TargetError::Invalid("name and type are required".to_string()));
        }
        if target.kind.is_remote()
            && target.host.as_deref().map(str::trim).unwrap_or_default().is_empty()
        {
            return Err(TargetError::Invalid(format!(
                "target {} of type {} requires a host",
                target.name,
                target.kind.as_str()
            )));
        }
        if self.find_target(&target.name).is_some() {
            return Err(TargetError::Duplicate(target.name));
        }
        self.targets.push(target);
        Ok(())
    }

    /// Swaps in a whole target list, checking each entry like `add_target`.
    /// On error the current list is left as it was.
    pub fn replace_targets(&mut self, targets: Vec<Target>) -> Result<(), TargetError> {
        let mut checked = Config {
            targets: Vec::with_capacity(targets.len()),
            ..Config::default()
        };
        for target in targets {
            checked.add_target(target)?;
        }
        self.targets = checked.targets;
        self.ensure_local_target();
        Ok(())
    }

    pub fn remove_target(&mut self, name: &str) -> Result<Target, TargetError> {
        if name == LOCAL_TARGET {
            return Err(TargetError::Protected(name.to_string()));
        }
        let idx = self
            .targets
            .iter()
            .position(|target| target.name == name)
            .ok_or_else(|| TargetError::NotFound(name.to_string()))?;
        Ok(self.targets.remove(idx))
    }

    /// The local target is always addressable, even if a hand-edited file dropped it.
    pub fn ensure_local_target(&mut self) {
        if self.find_target(LOCAL_TARGET).is_none() {
            self.targets.insert(0, Target::local());
        }
    }

    pub fn masked(&self) -> Config {
        Config {
            api_key: mask_api_key(&self.api_key),
            ..self.clone()
        }
    }
}

/// Process-wide handle on the persisted configuration.
///
/// Loads share the read lock; saves and read-modify-write cycles take the
/// write lock, so a reader never observes a half-written file.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: RwLock::new(()),
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("failed to resolve home directory")?;
        Ok(home.join(".modelrelay").join("config.json"))
    }

    /// Explicit path, then `MODELRELAY_CONFIG`, then the per-user default.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        Self::default_path()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Config> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| anyhow!("config lock poisoned"))?;
        read_config(&self.path)
    }

    pub fn save(&self, cfg: &Config) -> Result<()> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| anyhow!("config lock poisoned"))?;
        write_config(&self.path, cfg)
    }

    /// Loads, mutates and saves under a single write lock. Nothing is written
    /// when `f` fails.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Config) -> Result<T>,
    {
        let _guard = self
            .lock
            .write()
            .map_err(|_| anyhow!("config lock poisoned"))?;
        let mut cfg = read_config(&self.path)?;
        let out = f(&mut cfg)?;
        write_config(&self.path, &cfg)?;
        Ok(out)
    }
}

fn read_config(path: &Path) -> Result<Config> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed reading config file {}", path.display()));
        }
    };

    match serde_json::from_str::<Config>(&raw) {
        Ok(mut cfg) => {
            cfg.ensure_local_target();
            Ok(cfg)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "config file is invalid, using defaults");
            Ok(Config::default())
        }
    }
}

fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    let new_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty() && !parent.exists());
    if let Some(parent) = new_dir {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating config dir {}", parent.display()))?;
        restrict_permissions(parent, 0o700)?;
    }

    let raw = serde_json::to_string_pretty(cfg).context("failed serializing config")?;
    fs::write(path, raw)
        .with_context(|| format!("failed writing config file {}", path.display()))?;
    restrict_permissions(path, 0o600)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed setting permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        Config, ConfigStore, LOCAL_TARGET, Target, TargetError, TargetKind, parse_target_kind,
    };
    use std::fs;
    use tempfile::tempdir;

    fn staging() -> Target {
        Target {
            name: "staging".to_string(),
            kind: TargetKind::RemoteShell,
            host: Some("build01".to_string()),
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir should work");
        let store = ConfigStore::new(dir.path().join("config.json"));

        let cfg = store.load().expect("load should work");
        assert_eq!(cfg.targets, vec![Target::local()]);
        assert_eq!(cfg.model_mappings.len(), 3);
        assert_eq!(cfg.base_url, "https://api.anthropic.com");
        assert!(!store.path().exists());
    }

    #[test]
    fn unparsable_file_yields_defaults() {
        let dir = tempdir().expect("tempdir should work");
        let path = dir.path().join("config.json");
        fs::write(&path, "{\n  \"api_key\": ").expect("write should work");

        let cfg = ConfigStore::new(path).load().expect("load should work");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn save_then_reload_keeps_local_first() {
        let dir = tempdir().expect("tempdir should work");
        let store = ConfigStore::new(dir.path().join("nested").join("config.json"));

        let mut cfg = store.load().expect("load should work");
        cfg.add_target(staging()).expect("add should work");
        store.save(&cfg).expect("save should work");

        let reloaded = store.load().expect("reload should work");
        assert_eq!(reloaded.targets.len(), 2);
        assert_eq!(reloaded.targets[0].name, LOCAL_TARGET);
        assert_eq!(reloaded.targets[1], staging());
    }

    #[test]
    fn target_kind_serializes_with_type_key() {
        let raw = serde_json::to_string(&staging()).expect("serialize should work");
        assert_eq!(raw, r#"{"name":"staging","type":"remote-shell","host":"build01"}"#);
    }

    #[test]
    fn legacy_kind_names_are_accepted() {
        let parsed: Target = serde_json::from_str(r#"{"name":"cs","type":"codespace","host":"x"}"#)
            .expect("parse should work");
        assert_eq!(parsed.kind, TargetKind::RemoteCodespace);
        assert_eq!(parse_target_kind("SSH"), Some(TargetKind::RemoteShell));
        assert_eq!(parse_target_kind("ftp"), None);
    }

    #[test]
    fn missing_local_target_is_restored_on_load() {
        let dir = tempdir().expect("tempdir should work");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"targets":[{"name":"staging","type":"remote-shell","host":"build01"}]}"#,
        )
        .expect("write should work");

        let cfg = ConfigStore::new(path).load().expect("load should work");
        let names: Vec<&str> = cfg.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["local", "staging"]);
    }

    #[test]
    fn duplicate_and_protected_targets_are_rejected() {
        let mut cfg = Config::default();
        cfg.add_target(staging()).expect("add should work");

        assert_eq!(
            cfg.add_target(staging()),
            Err(TargetError::Duplicate("staging".to_string()))
        );
        assert_eq!(
            cfg.remove_target(LOCAL_TARGET),
            Err(TargetError::Protected("local".to_string()))
        );
        assert_eq!(
            cfg.remove_target("nope"),
            Err(TargetError::NotFound("nope".to_string()))
        );
        assert_eq!(cfg.remove_target("staging"), Ok(staging()));
    }

    #[test]
    fn remote_target_requires_host() {
        let mut cfg = Config::default();
        let err = cfg
            .add_target(Target {
                name: "box".to_string(),
                kind: TargetKind::RemoteShell,
                host: None,
            })
            .expect_err("add should fail");
        assert!(err.to_string().contains("requires a host"));
    }

    #[test]
    fn replace_targets_applies_add_rules() {
        let mut cfg = Config::default();
        cfg.add_target(staging()).expect("add should work");
        let before = cfg.targets.clone();

        let err = cfg
            .replace_targets(vec![staging(), staging()])
            .expect_err("duplicate should fail");
        assert_eq!(err, TargetError::Duplicate("staging".to_string()));
        let hostless = Target {
            host: Some("  ".to_string()),
            ..staging()
        };
        let err = cfg
            .replace_targets(vec![hostless])
            .expect_err("missing host should fail");
        assert!(matches!(err, TargetError::Invalid(_)));
        assert_eq!(cfg.targets, before);

        cfg.replace_targets(vec![staging()]).expect("replace should work");
        let names: Vec<&str> = cfg.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec![LOCAL_TARGET, "staging"]);
    }

    #[test]
    fn update_does_not_write_on_failure() {
        let dir = tempdir().expect("tempdir should work");
        let store = ConfigStore::new(dir.path().join("config.json"));

        let err = store
            .update(|cfg| {
                cfg.remove_target(LOCAL_TARGET)?;
                Ok(())
            })
            .expect_err("update should fail");
        assert!(err.downcast_ref::<TargetError>().is_some());
        assert!(!store.path().exists());

        store
            .update(|cfg| Ok(cfg.add_target(staging())?))
            .expect("update should work");
        assert_eq!(store.load().expect("load should work").targets.len(), 2);
    }
}
