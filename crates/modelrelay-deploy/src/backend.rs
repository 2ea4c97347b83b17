use crate::remote::{self, CommandChannel, RemoteShell};
use crate::settings;
use modelrelay_config::{Config, Target};
use modelrelay_patch::{
    self as patch, ApplyReport, BundleFile, Discoverer, Environment, Error, FileStatus,
    MappingTable, backup_name_for, backup_path_for,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How a backend finds its rewrite rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Discovery {
    /// Signatures scanned against the actual bundle.
    Adaptive,
    /// Exact rules for one known release.
    Fixed,
}

/// Where patch operations run. Both implementations share the mapping
/// serialization, the marker and the backup naming from `modelrelay_patch`.
pub trait PatchBackend {
    fn describe(&self) -> String;

    fn discovery(&self) -> Discovery;

    fn locate(&self, file: BundleFile) -> patch::Result<PathBuf>;

    fn apply(&self, path: &Path, table: &MappingTable) -> patch::Result<ApplyReport>;

    fn restore(&self, path: &Path) -> patch::Result<()>;

    /// `patched` reflects `marker`, so the same query serves the legacy file.
    fn inspect(&self, path: &Path, marker: &str) -> patch::Result<FileStatus>;

    fn settings_exist(&self) -> patch::Result<bool>;

    fn write_settings(&self, cfg: &Config) -> anyhow::Result<()>;
}

pub struct LocalBackend {
    home: PathBuf,
    discoverer: Discoverer,
}

impl LocalBackend {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            discoverer: Discoverer::standard(),
        }
    }

    pub fn with_discoverer(mut self, discoverer: Discoverer) -> Self {
        self.discoverer = discoverer;
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

impl PatchBackend for LocalBackend {
    fn describe(&self) -> String {
        "local".to_string()
    }

    fn discovery(&self) -> Discovery {
        Discovery::Adaptive
    }

    fn locate(&self, file: BundleFile) -> patch::Result<PathBuf> {
        patch::locate(&self.home, Environment::Local, file)
    }

    fn apply(&self, path: &Path, table: &MappingTable) -> patch::Result<ApplyReport> {
        patch::apply_patch_with(path, table, &self.discoverer)
    }

    fn restore(&self, path: &Path) -> patch::Result<()> {
        patch::restore_backup(path)
    }

    fn inspect(&self, path: &Path, marker: &str) -> patch::Result<FileStatus> {
        Ok(FileStatus {
            patched: patch::contains_marker(path, marker),
            backup_exists: patch::has_backup(path),
        })
    }

    fn settings_exist(&self) -> patch::Result<bool> {
        Ok(settings::agent_settings_path(&self.home).is_file())
    }

    fn write_settings(&self, cfg: &Config) -> anyhow::Result<()> {
        settings::write_agent_settings(&self.home, cfg)?;
        settings::write_editor_settings(&self.home, &cfg.mcp_servers)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RemoteApplyOutput {
    backup_created: bool,
    applied: Vec<String>,
}

/// Drives the same operations through one-shot shell commands.
pub struct RemoteBackend<C: CommandChannel> {
    channel: C,
    rules: Vec<patch::PatchPoint>,
}

impl RemoteBackend<RemoteShell> {
    pub fn for_target(target: &Target) -> patch::Result<Self> {
        Ok(Self::new(RemoteShell::for_target(target)?))
    }
}

impl<C: CommandChannel> RemoteBackend<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            rules: Discoverer::standard().fixed_rules(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn yes(&self, script: &str) -> patch::Result<bool> {
        Ok(self.channel.execute(script)? == "yes")
    }
}

impl<C: CommandChannel> PatchBackend for RemoteBackend<C> {
    fn describe(&self) -> String {
        self.channel.describe()
    }

    fn discovery(&self) -> Discovery {
        Discovery::Fixed
    }

    fn locate(&self, file: BundleFile) -> patch::Result<PathBuf> {
        let found = self.channel.execute(&remote::locate_script(file))?;
        let path = found.lines().last().unwrap_or_default().trim();
        if path.is_empty() {
            return Err(Error::NotFound(format!(
                "{} not found on {}",
                file.file_name(),
                self.channel.describe()
            )));
        }
        Ok(PathBuf::from(path))
    }

    fn apply(&self, path: &Path, table: &MappingTable) -> patch::Result<ApplyReport> {
        let live = path.to_string_lossy();
        let backup = backup_name_for(&live);
        let script = remote::apply_script(&live, &backup, table, &self.rules);
        let out = self
            .channel
            .execute(&script)
            .map_err(|err| remote::classify(err, &backup))?;

        let line = out.lines().last().unwrap_or_default();
        let parsed: RemoteApplyOutput = serde_json::from_str(line).map_err(|err| {
            Error::RemoteTransport(format!("unexpected patch output {line:?}: {err}"))
        })?;
        Ok(ApplyReport {
            path: path.to_path_buf(),
            backup_path: backup_path_for(path),
            backup_created: parsed.backup_created,
            applied: parsed.applied,
        })
    }

    fn restore(&self, path: &Path) -> patch::Result<()> {
        let live = path.to_string_lossy();
        let backup = backup_name_for(&live);
        self.channel
            .execute(&remote::restore_script(&live, &backup))
            .map_err(|err| remote::classify(err, &backup))?;
        Ok(())
    }

    fn inspect(&self, path: &Path, marker: &str) -> patch::Result<FileStatus> {
        let live = path.to_string_lossy();
        let count = self
            .channel
            .execute(&remote::marker_count_script(&live, marker))?;
        let backup_exists = self.yes(&remote::file_exists_script(&backup_name_for(&live)))?;
        Ok(FileStatus {
            patched: count.trim().parse::<u64>().is_ok_and(|n| n > 0),
            backup_exists,
        })
    }

    fn settings_exist(&self) -> patch::Result<bool> {
        self.yes(remote::AGENT_SETTINGS_EXISTS_SCRIPT)
    }

    fn write_settings(&self, cfg: &Config) -> anyhow::Result<()> {
        let raw = settings::agent_settings_json(cfg)?;
        self.channel
            .execute(&remote::write_agent_settings_script(&raw))?;
        Ok(())
    }
}
