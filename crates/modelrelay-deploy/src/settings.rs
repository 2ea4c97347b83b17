use anyhow::{Context, Result};
use modelrelay_config::{Config, McpServer};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Request timeout handed to the agent, in milliseconds.
pub const AGENT_API_TIMEOUT_MS: &str = "3000000";
pub const EDITOR_MCP_FLAG: &str = "github.copilot.chat.cli.mcp.enabled";

pub fn agent_settings_path(home: &Path) -> PathBuf {
    home.join(".claude").join("settings.json")
}

/// Prefers the server-side machine settings when that profile exists.
pub fn editor_settings_path(home: &Path) -> PathBuf {
    let machine = home.join(".vscode-server").join("data").join("Machine");
    if machine.is_dir() {
        return machine.join("settings.json");
    }
    home.join(".config").join("Code").join("User").join("settings.json")
}

fn env_block(cfg: &Config) -> Value {
    json!({
        "ANTHROPIC_BASE_URL": cfg.base_url,
        "ANTHROPIC_API_KEY": cfg.api_key,
        "ANTHROPIC_DEFAULT_OPUS_MODEL": cfg.default_opus_model,
        "ANTHROPIC_DEFAULT_SONNET_MODEL": cfg.default_sonnet_model,
        "ANTHROPIC_DEFAULT_HAIKU_MODEL": cfg.default_haiku_model,
        "ANTHROPIC_SMALL_FAST_MODEL": cfg.default_haiku_model,
        "API_TIMEOUT_MS": AGENT_API_TIMEOUT_MS,
    })
}

fn enabled_servers(servers: &[McpServer]) -> Map<String, Value> {
    servers
        .iter()
        .filter(|server| server.enabled)
        .map(|server| {
            (
                server.name.clone(),
                json!({ "command": server.command, "args": server.args }),
            )
        })
        .collect()
}

/// Overlays the relay env block and enabled tool servers onto `existing`.
/// Every other key is left as it was.
pub fn merge_agent_settings(existing: Map<String, Value>, cfg: &Config) -> Map<String, Value> {
    let mut settings = existing;
    settings.insert("env".to_string(), env_block(cfg));
    let servers = enabled_servers(&cfg.mcp_servers);
    if !servers.is_empty() {
        settings.insert("mcpServers".to_string(), Value::Object(servers));
    }
    settings
}

/// Settings document for a host whose current file is not read first.
pub fn agent_settings_json(cfg: &Config) -> Result<String> {
    let settings = merge_agent_settings(Map::new(), cfg);
    serde_json::to_string_pretty(&settings).context("failed serializing agent settings")
}

pub fn merge_editor_settings(
    existing: Map<String, Value>,
    servers: &[McpServer],
) -> Map<String, Value> {
    let mut settings = existing;
    settings.insert(EDITOR_MCP_FLAG.to_string(), Value::Bool(true));

    let servers = enabled_servers(servers);
    if !servers.is_empty() {
        let mut mcp = match settings.remove("mcp") {
            Some(Value::Object(mcp)) => mcp,
            _ => Map::new(),
        };
        mcp.insert("servers".to_string(), Value::Object(servers));
        settings.insert("mcp".to_string(), Value::Object(mcp));
    }
    settings
}

pub fn write_agent_settings(home: &Path, cfg: &Config) -> Result<PathBuf> {
    let path = agent_settings_path(home);
    let settings = merge_agent_settings(read_json_object(&path), cfg);
    let raw = serde_json::to_string_pretty(&settings).context("failed serializing agent settings")?;
    write_private(&path, &raw)?;
    info!(path = %path.display(), "wrote agent settings");
    Ok(path)
}

pub fn write_editor_settings(home: &Path, servers: &[McpServer]) -> Result<PathBuf> {
    let path = editor_settings_path(home);
    let settings = merge_editor_settings(read_json_object(&path), servers);
    let raw = to_string_indented(&settings, b"    ")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    fs::write(&path, raw).with_context(|| format!("failed writing {}", path.display()))?;
    info!(path = %path.display(), "wrote editor settings");
    Ok(path)
}

/// Missing or malformed files read as an empty object.
fn read_json_object(path: &Path) -> Map<String, Value> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!(path = %path.display(), "existing settings are not a JSON object, replacing");
            Map::new()
        }
    }
}

fn to_string_indented<T: Serialize>(value: &T, indent: &[u8]) -> Result<String> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(indent));
    value
        .serialize(&mut ser)
        .context("failed serializing settings")?;
    String::from_utf8(out).context("settings are not valid UTF-8")
}

fn write_private(path: &Path, raw: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.exists()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
        restrict(parent, 0o700)?;
    }
    fs::write(path, raw).with_context(|| format!("failed writing {}", path.display()))?;
    restrict(path, 0o600)
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed setting permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
