//! Discovery and text rewriting for the model-remapping patch.
//!
//! The engine never parses JavaScript. It injects a lookup table in front of
//! the bundle's first import and rewrites a handful of function entry points
//! that it finds by structural signature, so the same code keeps working when
//! the minifier renames symbols between releases.

mod apply;
mod backup;
mod discover;
mod error;
mod locate;
mod mapping;

pub use apply::{
    ApplyReport, PRIMARY_ENTRY_ANCHOR, PatchedContent, SECONDARY_ENTRY_ANCHOR, apply_patch,
    apply_patch_with, inject_header, patch_content,
};
pub use backup::{FileStatus, contains_marker, has_backup, inspect, is_patched, restore_backup};
pub use discover::{
    AnsiStripMatcher, ClientFactoryMatcher, Discoverer, PatchPoint, SIGNATURE_WINDOW,
    SignatureMatch, SignatureMatcher, StreamingGeneratorMatcher, discover_patch_points,
};
pub use error::{Error, Result};
pub use locate::{BundleFile, Environment, locate, relative_patterns, search_patterns};
pub use mapping::{MAP_FUNCTION, MappingTable};

use std::path::{Path, PathBuf};

/// Leads every header injection; its presence means "patched".
pub const PATCH_MARKER: &str = "/* modelrelay-cli-patch */";
/// Written into `extension.js` by the retired append-style patch.
pub const LEGACY_PATCH_MARKER: &str = "/* modelrelay-patch-begin */";
pub const BACKUP_SUFFIX: &str = ".modelrelay-backup";

pub fn backup_path_for(file: &Path) -> PathBuf {
    let mut backup = file.as_os_str().to_os_string();
    backup.push(BACKUP_SUFFIX);
    PathBuf::from(backup)
}

/// Same naming as [`backup_path_for`] for paths that only exist on a remote host.
pub fn backup_name_for(path: &str) -> String {
    format!("{path}{BACKUP_SUFFIX}")
}
