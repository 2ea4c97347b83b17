use modelrelay_config::{Target, TargetKind};
use modelrelay_patch::{
    BundleFile, Environment, Error, MappingTable, PATCH_MARKER, PatchPoint, PRIMARY_ENTRY_ANCHOR,
    Result, SECONDARY_ENTRY_ANCHOR, relative_patterns,
};
use serde_json::json;
use std::process::{Command, Stdio};
use tracing::debug;

pub(crate) const FORMAT_CHANGED_TAG: &str = "format-changed";
pub(crate) const ALREADY_PATCHED_TAG: &str = "already-patched";
pub(crate) const BACKUP_FAILED_TAG: &str = "backup-failed";
pub(crate) const NOT_FOUND_TAG: &str = "not-found";

/// Something that runs one POSIX shell script on a host and returns its
/// trimmed stdout.
pub trait CommandChannel {
    fn describe(&self) -> String;

    fn execute(&self, script: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Ssh,
    Codespace,
}

/// One-shot commands over `ssh` or `gh codespace ssh`. The transport is
/// expected to be authenticated already.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShell {
    transport: Transport,
    host: String,
}

impl RemoteShell {
    pub fn new(transport: Transport, host: impl Into<String>) -> Self {
        Self {
            transport,
            host: host.into(),
        }
    }

    pub fn for_target(target: &Target) -> Result<Self> {
        let transport = match target.kind {
            TargetKind::RemoteShell => Transport::Ssh,
            TargetKind::RemoteCodespace => Transport::Codespace,
            TargetKind::Local => {
                return Err(Error::RemoteTransport(format!(
                    "target {} is local",
                    target.name
                )));
            }
        };
        let host = target
            .host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .ok_or_else(|| {
                Error::RemoteTransport(format!("target {} has no host configured", target.name))
            })?;
        Ok(Self::new(transport, host))
    }

    pub fn command(&self, script: &str) -> Command {
        match self.transport {
            Transport::Ssh => {
                let mut cmd = Command::new("ssh");
                cmd.arg(&self.host).arg(script);
                cmd
            }
            Transport::Codespace => {
                let mut cmd = Command::new("gh");
                cmd.args(["codespace", "ssh", "-c", &self.host, "--", script]);
                cmd
            }
        }
    }
}

impl CommandChannel for RemoteShell {
    fn describe(&self) -> String {
        match self.transport {
            Transport::Ssh => format!("ssh {}", self.host),
            Transport::Codespace => format!("codespace {}", self.host),
        }
    }

    fn execute(&self, script: &str) -> Result<String> {
        debug!(channel = %self.describe(), bytes = script.len(), "running remote command");
        run_captured(self.command(script))
    }
}

/// Runs `command` to completion with stdout and stderr captured separately.
pub fn run_captured(mut command: Command) -> Result<String> {
    let program = command.get_program().to_string_lossy().into_owned();
    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|err| Error::RemoteTransport(format!("failed to run {program}: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            output.status.to_string()
        } else {
            stderr
        };
        return Err(Error::RemoteTransport(message));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r#"'\''"#))
}

/// Newest matching bundle, or empty output when nothing is installed.
pub fn locate_script(file: BundleFile) -> String {
    format!(
        "ls -1d {} 2>/dev/null | LC_ALL=C sort | tail -n 1",
        relative_patterns(Environment::Remote, file).join(" ")
    )
}

pub fn marker_count_script(path: &str, marker: &str) -> String {
    format!(
        "grep -c -F -- {} {} 2>/dev/null || true",
        shell_quote(marker),
        shell_quote(path)
    )
}

pub fn file_exists_script(path: &str) -> String {
    format!("test -f {} && echo yes || echo no", shell_quote(path))
}

pub fn restore_script(path: &str, backup: &str) -> String {
    let missing = format!("{NOT_FOUND_TAG}: no backup found at {backup}");
    format!(
        "test -f {b} || {{ echo {msg} >&2; exit 1; }}; cp {b} {p}",
        b = shell_quote(backup),
        p = shell_quote(path),
        msg = shell_quote(&missing),
    )
}

pub const AGENT_SETTINGS_EXISTS_SCRIPT: &str =
    "test -f ~/.claude/settings.json && echo yes || echo no";

pub fn write_agent_settings_script(settings_json: &str) -> String {
    format!(
        "mkdir -p ~/.claude && cat > ~/.claude/settings.json <<'EOFCLAUDE'\n{settings_json}\nEOFCLAUDE"
    )
}

/// Python program applying `rules` to the bundle at `path`.
///
/// Mirrors the local applier: pristine content comes from the backup when it
/// exists, the header lands before the first entry anchor, and the backup is
/// only written once at least one rule applied. Failures are reported on
/// stderr as `<tag>: <message>`. On success a single JSON line
/// `{"backup_created": bool, "applied": [names]}` is printed.
pub fn apply_script(path: &str, backup: &str, table: &MappingTable, rules: &[PatchPoint]) -> String {
    let rules: Vec<_> = rules
        .iter()
        .map(|rule| json!({ "name": rule.name, "old": rule.old, "new": rule.new }))
        .collect();
    let anchors = [PRIMARY_ENTRY_ANCHOR, SECONDARY_ENTRY_ANCHOR];

    format!(
        r#"python3 - <<'EOFPATCH'
import json, os, shutil, sys
path = {path}
backup = {backup}
marker = {marker}
header = {header}
anchors = {anchors}
rules = {rules}

def fail(tag, message):
    sys.stderr.write(tag + ": " + message + "\n")
    sys.exit(1)

has_backup = os.path.isfile(backup)
with open(backup if has_backup else path, "r", encoding="utf-8", newline="") as f:
    content = f.read()
if not has_backup and marker in content:
    fail("{already}", path + " carries the patch marker but has no backup")
at = -1
for anchor in anchors:
    at = content.find(anchor)
    if at >= 0:
        break
if at < 0:
    fail("{format}", "cannot find an import statement to inject before")
content = content[:at] + header + content[at:]
applied = []
for rule in rules:
    if rule["old"] in content:
        content = content.replace(rule["old"], rule["new"], 1)
        applied.append(rule["name"])
if not applied:
    fail("{format}", "no fixed patch rules matched the remote bundle")
if not has_backup:
    try:
        shutil.copyfile(path, backup)
    except OSError as err:
        fail("{backup_tag}", str(err))
with open(path, "w", encoding="utf-8", newline="") as f:
    f.write(content)
print(json.dumps({{"backup_created": not has_backup, "applied": applied}}))
EOFPATCH"#,
        path = json!(path),
        backup = json!(backup),
        marker = json!(PATCH_MARKER),
        header = json!(table.header_snippet()),
        anchors = json!(anchors),
        rules = serde_json::Value::Array(rules),
        already = ALREADY_PATCHED_TAG,
        format = FORMAT_CHANGED_TAG,
        backup_tag = BACKUP_FAILED_TAG,
    )
}

/// Turns a tagged stderr line from the remote scripts back into the matching
/// local error kind. Untagged failures stay transport errors.
pub(crate) fn classify(err: Error, backup: &str) -> Error {
    let Error::RemoteTransport(message) = err else {
        return err;
    };
    for line in message.lines() {
        let Some((tag, detail)) = line.split_once(": ") else {
            continue;
        };
        let detail = detail.trim().to_string();
        match tag.trim() {
            FORMAT_CHANGED_TAG => return Error::FormatChanged(detail),
            ALREADY_PATCHED_TAG => return Error::AlreadyPatched(detail),
            NOT_FOUND_TAG => return Error::NotFound(detail),
            BACKUP_FAILED_TAG => {
                return Error::Backup {
                    path: backup.to_string(),
                    reason: detail,
                };
            }
            _ => {}
        }
    }
    Error::RemoteTransport(message)
}
