//! Deploy, inspect and restore the model-remapping patch on a target host.

mod backend;
mod deployer;
pub mod remote;
pub mod settings;

pub use backend::{Discovery, LocalBackend, PatchBackend, RemoteBackend};
pub use deployer::{
    BoxError, DeployError, DeployReport, DeployState, DeployStatus, DeployStep, Deployer,
    NOT_FOUND_PATH, RestoreReport, deploy_with, mapping_table, restore_with, status_with,
};
pub use remote::{CommandChannel, RemoteShell, Transport, run_captured};
