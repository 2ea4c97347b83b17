use crate::backend::{Discovery, LocalBackend, PatchBackend, RemoteBackend};
use anyhow::Context;
use modelrelay_config::{Config, Target};
use modelrelay_patch::{self as patch, BundleFile, LEGACY_PATCH_MARKER, MappingTable, PATCH_MARKER};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shown as the path of a bundle that could not be located.
pub const NOT_FOUND_PATH: &str = "not found";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployStep {
    Locate,
    Backup,
    Patch,
    WriteSettings,
    Restore,
    Status,
}

impl DeployStep {
    pub fn as_str(self) -> &'static str {
        match self {
            DeployStep::Locate => "locate",
            DeployStep::Backup => "backup",
            DeployStep::Patch => "patch",
            DeployStep::WriteSettings => "write-settings",
            DeployStep::Restore => "restore",
            DeployStep::Status => "status",
        }
    }
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last state a flow reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployState {
    Located,
    BackedUp,
    Patched,
    SettingsWritten,
    Restored,
}

#[derive(Debug, Error)]
#[error("{step} failed for target {target}: {source}")]
pub struct DeployError {
    pub target: String,
    pub step: DeployStep,
    #[source]
    pub source: BoxError,
}

impl DeployError {
    pub fn new(target: &str, step: DeployStep, source: impl Into<BoxError>) -> Self {
        Self {
            target: target.to_string(),
            step,
            source: source.into(),
        }
    }

    pub fn patch_error(&self) -> Option<&patch::Error> {
        self.source.downcast_ref::<patch::Error>()
    }

    pub fn is_not_found(&self) -> bool {
        self.patch_error().is_some_and(patch::Error::is_not_found)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub target: String,
    pub path: PathBuf,
    pub backup_created: bool,
    pub applied: Vec<String>,
    pub discovery: Discovery,
    pub legacy_cleaned: bool,
    pub state: DeployState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub target: String,
    pub path: PathBuf,
    pub legacy_restored: bool,
    pub state: DeployState,
}

/// Recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployStatus {
    pub target: String,
    pub path: String,
    pub patched: bool,
    pub backup_exists: bool,
    pub settings_exist: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_path: Option<String>,
    pub legacy_patched: bool,
}

pub fn mapping_table(cfg: &Config) -> MappingTable {
    MappingTable::from_pairs(
        cfg.model_mappings
            .iter()
            .map(|m| (m.vscode_id.as_str(), m.relay_id.as_str())),
    )
}

fn reached(target_name: &str, state: DeployState) {
    debug!(target_name, ?state, "deploy state");
}

fn apply_step(err: &patch::Error) -> DeployStep {
    match err {
        patch::Error::Backup { .. } => DeployStep::Backup,
        _ => DeployStep::Patch,
    }
}

/// Restores `extension.js` when the retired patch is still in it.
/// Errors are returned to the caller for logging only.
fn clean_legacy(backend: &dyn PatchBackend) -> patch::Result<bool> {
    let path = match backend.locate(BundleFile::Extension) {
        Ok(path) => path,
        Err(err) if err.is_not_found() => return Ok(false),
        Err(err) => return Err(err),
    };
    let status = backend.inspect(&path, LEGACY_PATCH_MARKER)?;
    if !(status.patched && status.backup_exists) {
        return Ok(false);
    }
    backend.restore(&path)?;
    info!(path = %path.display(), "removed legacy extension patch");
    Ok(true)
}

pub fn deploy_with(
    backend: &dyn PatchBackend,
    target: &Target,
    cfg: &Config,
) -> Result<DeployReport, DeployError> {
    let name = target.name.as_str();
    if backend.discovery() == Discovery::Fixed {
        warn!(
            target_name = name,
            "remote deploy uses fixed rules for a known release; signature discovery only runs locally"
        );
    }

    let legacy_cleaned = clean_legacy(backend).unwrap_or_else(|err| {
        warn!(target_name = name, error = %err, "legacy cleanup failed, continuing");
        false
    });

    let path = backend
        .locate(BundleFile::Cli)
        .map_err(|err| DeployError::new(name, DeployStep::Locate, err))?;
    info!(target_name = name, path = %path.display(), "located bundle");
    reached(name, DeployState::Located);

    let table = mapping_table(cfg);
    let applied = backend
        .apply(&path, &table)
        .map_err(|err| DeployError::new(name, apply_step(&err), err))?;
    reached(name, DeployState::BackedUp);
    reached(name, DeployState::Patched);

    backend
        .write_settings(cfg)
        .map_err(|err| DeployError::new(name, DeployStep::WriteSettings, err))?;
    reached(name, DeployState::SettingsWritten);

    info!(
        target_name = name,
        via = %backend.describe(),
        applied = ?applied.applied,
        "deploy finished"
    );
    Ok(DeployReport {
        target: name.to_string(),
        path,
        backup_created: applied.backup_created,
        applied: applied.applied,
        discovery: backend.discovery(),
        legacy_cleaned,
        state: DeployState::SettingsWritten,
    })
}

pub fn status_with(backend: &dyn PatchBackend, target: &Target) -> Result<DeployStatus, DeployError> {
    let name = target.name.as_str();
    let fail = |err: patch::Error| DeployError::new(name, DeployStep::Status, err);

    let mut status = DeployStatus {
        target: name.to_string(),
        path: NOT_FOUND_PATH.to_string(),
        patched: false,
        backup_exists: false,
        settings_exist: backend.settings_exist().map_err(fail)?,
        legacy_path: None,
        legacy_patched: false,
    };

    match backend.locate(BundleFile::Cli) {
        Ok(path) => {
            let file = backend.inspect(&path, PATCH_MARKER).map_err(fail)?;
            status.path = path.display().to_string();
            status.patched = file.patched;
            status.backup_exists = file.backup_exists;
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(fail(err)),
    }

    match backend.locate(BundleFile::Extension) {
        Ok(path) => {
            let file = backend.inspect(&path, LEGACY_PATCH_MARKER).map_err(fail)?;
            status.legacy_path = Some(path.display().to_string());
            status.legacy_patched = file.patched;
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(fail(err)),
    }

    Ok(status)
}

/// The bundle restore is fatal, the legacy restore is not.
pub fn restore_with(backend: &dyn PatchBackend, target: &Target) -> Result<RestoreReport, DeployError> {
    let name = target.name.as_str();

    let legacy_restored = match restore_legacy(backend) {
        Ok(restored) => restored,
        Err(err) => {
            warn!(target_name = name, error = %err, "legacy restore failed, continuing");
            false
        }
    };

    let path = backend
        .locate(BundleFile::Cli)
        .map_err(|err| DeployError::new(name, DeployStep::Locate, err))?;
    reached(name, DeployState::Located);
    backend
        .restore(&path)
        .map_err(|err| DeployError::new(name, DeployStep::Restore, err))?;
    reached(name, DeployState::Restored);

    info!(target_name = name, path = %path.display(), "restored bundle");
    Ok(RestoreReport {
        target: name.to_string(),
        path,
        legacy_restored,
        state: DeployState::Restored,
    })
}

fn restore_legacy(backend: &dyn PatchBackend) -> patch::Result<bool> {
    let path = match backend.locate(BundleFile::Extension) {
        Ok(path) => path,
        Err(err) if err.is_not_found() => return Ok(false),
        Err(err) => return Err(err),
    };
    if !backend.inspect(&path, LEGACY_PATCH_MARKER)?.backup_exists {
        return Ok(false);
    }
    backend.restore(&path)?;
    Ok(true)
}

/// Picks the backend for a target and runs the flows against it.
#[derive(Debug, Clone)]
pub struct Deployer {
    home: PathBuf,
}

impl Deployer {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn from_home_dir() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("failed to resolve home directory")?;
        Ok(Self::new(home))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn backend_for(&self, target: &Target) -> Result<Box<dyn PatchBackend>, DeployError> {
        if !target.kind.is_remote() {
            return Ok(Box::new(LocalBackend::new(&self.home)));
        }
        let backend = RemoteBackend::for_target(target)
            .map_err(|err| DeployError::new(&target.name, DeployStep::Locate, err))?;
        Ok(Box::new(backend))
    }

    pub fn deploy(&self, target: &Target, cfg: &Config) -> Result<DeployReport, DeployError> {
        deploy_with(self.backend_for(target)?.as_ref(), target, cfg)
    }

    pub fn status(&self, target: &Target) -> Result<DeployStatus, DeployError> {
        status_with(self.backend_for(target)?.as_ref(), target)
    }

    pub fn restore(&self, target: &Target) -> Result<RestoreReport, DeployError> {
        restore_with(self.backend_for(target)?.as_ref(), target)
    }
}

#[cfg(test)]
mod tests {
    use super::{DeployError, DeployStep, apply_step, mapping_table};
    use modelrelay_config::{Config, ModelMapping};
    use modelrelay_patch::Error;

    #[test]
    fn table_follows_config_order_for_duplicates() {
        let mut cfg = Config::default();
        cfg.model_mappings.push(ModelMapping {
            vscode_id: "claude-opus-4.6".to_string(),
            relay_id: "override".to_string(),
        });
        let table = mapping_table(&cfg);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("claude-opus-4.6"), Some("override"));
    }

    #[test]
    fn backup_failures_are_attributed_to_backup_step() {
        let backup = Error::Backup {
            path: "/b".to_string(),
            reason: "read-only".to_string(),
        };
        assert_eq!(apply_step(&backup), DeployStep::Backup);
        assert_eq!(apply_step(&Error::FormatChanged("x".to_string())), DeployStep::Patch);
    }

    #[test]
    fn error_names_target_and_step() {
        let err = DeployError::new("staging", DeployStep::WriteSettings, Error::NotFound("gone".to_string()));
        assert_eq!(err.to_string(), "write-settings failed for target staging: gone");
        assert!(err.is_not_found());
    }
}
