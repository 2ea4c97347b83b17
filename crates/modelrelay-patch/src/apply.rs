use crate::backup::has_backup;
use crate::discover::Discoverer;
use crate::error::{Error, Result};
use crate::mapping::MappingTable;
use crate::{PATCH_MARKER, backup_path_for};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Top-level ESM entry of the bundle; the header goes right before it.
pub const PRIMARY_ENTRY_ANCHOR: &str = "import{createRequire";
pub const SECONDARY_ENTRY_ANCHOR: &str = "import ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedContent {
    pub content: String,
    pub applied: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub path: PathBuf,
    pub backup_path: PathBuf,
    pub backup_created: bool,
    pub applied: Vec<String>,
}

pub fn inject_header(content: &str, header: &str) -> Result<String> {
    let at = content
        .find(PRIMARY_ENTRY_ANCHOR)
        .or_else(|| content.find(SECONDARY_ENTRY_ANCHOR))
        .ok_or_else(|| {
            Error::FormatChanged("cannot find an import statement to inject before".to_string())
        })?;

    let mut out = String::with_capacity(content.len() + header.len());
    out.push_str(&content[..at]);
    out.push_str(header);
    out.push_str(&content[at..]);
    Ok(out)
}

/// Pure transformation of pristine bundle text. Fails unless at least one
/// function-level rewrite lands; a header alone is never a success.
pub fn patch_content(
    pristine: &str,
    table: &MappingTable,
    discoverer: &Discoverer,
) -> Result<PatchedContent> {
    let mut content = inject_header(pristine, &table.header_snippet())?;

    let mut applied = Vec::new();
    for point in discoverer.discover(&content) {
        let Some(at) = content.find(&point.old) else {
            continue;
        };
        content.replace_range(at..at + point.old.len(), &point.new);
        debug!(patch = %point.name, offset = at, "applied patch point");
        applied.push(point.name);
    }

    if applied.is_empty() {
        return Err(Error::FormatChanged(format!(
            "no function-level patch points matched (tried {}); minified names may have changed",
            discoverer.names().join(", ")
        )));
    }

    Ok(PatchedContent { content, applied })
}

pub fn apply_patch(path: &Path, table: &MappingTable) -> Result<ApplyReport> {
    apply_patch_with(path, table, &Discoverer::standard())
}

/// Patches `path` starting from pristine content.
///
/// The backup, when present, is the source of truth: the live file may carry
/// an earlier patch whose rewrites no longer match any signature. The backup
/// is written only once the patch is known to succeed and is never
/// overwritten.
pub fn apply_patch_with(
    path: &Path,
    table: &MappingTable,
    discoverer: &Discoverer,
) -> Result<ApplyReport> {
    let backup = backup_path_for(path);
    let backup_exists = has_backup(path);

    let pristine = if backup_exists {
        fs::read_to_string(&backup).map_err(Error::io("read backup", &backup))?
    } else {
        let live = fs::read_to_string(path).map_err(Error::io("read", path))?;
        if live.contains(PATCH_MARKER) {
            return Err(Error::AlreadyPatched(path.display().to_string()));
        }
        live
    };

    let patched = patch_content(&pristine, table, discoverer)?;

    if !backup_exists {
        fs::write(&backup, &pristine).map_err(|err| Error::Backup {
            path: backup.display().to_string(),
            reason: err.to_string(),
        })?;
        info!(backup = %backup.display(), "created pristine backup");
    }

    fs::write(path, &patched.content).map_err(Error::io("write", path))?;
    info!(
        path = %path.display(),
        applied = ?patched.applied,
        "patched bundle"
    );

    Ok(ApplyReport {
        path: path.to_path_buf(),
        backup_path: backup,
        backup_created: !backup_exists,
        applied: patched.applied,
    })
}

#[cfg(test)]
mod tests {
    use super::{PRIMARY_ENTRY_ANCHOR, inject_header, patch_content};
    use crate::discover::Discoverer;
    use crate::error::Error;
    use crate::mapping::MappingTable;

    #[test]
    fn header_goes_before_create_require_import() {
        let content = "#!/usr/bin/env node\nimport a from'b';import{createRequire as r}from'm';";
        let out = inject_header(content, "/*H*/").expect("inject should work");
        let at = out.find("/*H*/").expect("header present");
        assert_eq!(&out[at + 5..at + 5 + PRIMARY_ENTRY_ANCHOR.len()], PRIMARY_ENTRY_ANCHOR);
        assert!(out.starts_with("#!/usr/bin/env node\nimport a"));
    }

    #[test]
    fn header_falls_back_to_plain_import() {
        let out = inject_header("//c\nimport x from'y';", "/*H*/").expect("inject should work");
        assert_eq!(out, "//c\n/*H*/import x from'y';");
    }

    #[test]
    fn missing_import_is_format_change() {
        let err = inject_header("var a=1;", "/*H*/").expect_err("must fail");
        assert!(matches!(err, Error::FormatChanged(_)));
    }

    #[test]
    fn header_only_is_not_success() {
        let table = MappingTable::from_pairs([("a", "b")]);
        let err = patch_content("import x from'y';x()", &table, &Discoverer::standard())
            .expect_err("must fail");
        assert!(err.to_string().contains("no function-level patch points"));
    }

    #[test]
    fn later_satisfying_generator_is_left_untouched() {
        let second = "async function*b(A,Q,B){let G=g(B)";
        let pristine = format!(
            "import{{createRequire as r}}from'm';async function*a(A,Q,B){{let G=f(B);yield{{model:B.model}}}}{second};yield{{model:B.model}}}}"
        );
        let table = MappingTable::from_pairs([("claude-opus-4.6", "relay-opus")]);
        let patched =
            patch_content(&pristine, &table, &Discoverer::standard()).expect("patch should work");

        assert_eq!(patched.applied, vec!["streaming-generator"]);
        assert_eq!(patched.content.matches("B.model=globalThis.__cliMap").count(), 1);
        assert!(patched.content.contains(second));
        assert!(
            patched
                .content
                .contains("async function*a(A,Q,B){B.model=globalThis.__cliMap(B.model);let G=f(B)")
        );
    }
}
