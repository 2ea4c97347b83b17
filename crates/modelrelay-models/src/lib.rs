use anyhow::{Context, Result, anyhow};
use modelrelay_config::ModelMapping;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DETECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Keyword preference lists, most specific first.
const OPUS_MAPPING_KEYWORDS: &[&str] = &["thinking", "opus-4-6", "opus-3-5", "opus"];
const OPUS_DEFAULT_KEYWORDS: &[&str] = &["opus-4-6", "opus-4-5", "opus"];
const SONNET_KEYWORDS: &[&str] = &["sonnet-4-5", "sonnet-4", "sonnet-3-5", "sonnet"];
const HAIKU_KEYWORDS: &[&str] = &["haiku-4-5", "haiku-3-5", "haiku"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayModel {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<RelayModel>,
}

/// Anything that can list the models a relay serves.
pub trait ModelCatalog {
    fn list_models(&self) -> Result<Vec<RelayModel>>;
}

#[derive(Clone)]
pub struct RelayClient {
    pub base_url: String,
    pub api_key: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

/// `<base>/v1/models`, without doubling a `/v1` the base already carries.
pub fn models_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/models")
    } else {
        format!("{base}/v1/models")
    }
}

impl ModelCatalog for RelayClient {
    fn list_models(&self) -> Result<Vec<RelayModel>> {
        let client = Client::builder()
            .timeout(DETECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let url = models_url(&self.base_url);
        debug!(%url, "listing relay models");

        let mut request = client.get(&url);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().context("relay unreachable")?;

        if !response.status().is_success() {
            return Err(anyhow!("relay returned HTTP {}", response.status().as_u16()));
        }

        let mut parsed: ModelsResponse = response
            .json()
            .context("failed to decode relay model list")?;
        parsed.data.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(parsed.data)
    }
}

/// First keyword with any hit wins. Among its hits `thinking` variants come
/// first, then longer (more specific) ids.
pub fn find_best<'a>(ids: &[&'a str], keywords: &[&str]) -> Option<&'a str> {
    keywords.iter().find_map(|keyword| {
        ids.iter()
            .copied()
            .filter(|id| id.contains(keyword))
            .min_by(|a, b| {
                b.contains("thinking")
                    .cmp(&a.contains("thinking"))
                    .then_with(|| b.len().cmp(&a.len()))
            })
    })
}

fn ids(models: &[RelayModel]) -> Vec<&str> {
    models.iter().map(|model| model.id.as_str()).collect()
}

/// Editor ids paired with the best relay match for their tier.
pub fn suggest_mappings(models: &[RelayModel]) -> Vec<ModelMapping> {
    let ids = ids(models);
    [
        ("claude-opus-4.6", OPUS_MAPPING_KEYWORDS),
        ("claude-sonnet-4.5", SONNET_KEYWORDS),
        ("claude-haiku-4.5", HAIKU_KEYWORDS),
    ]
    .into_iter()
    .filter_map(|(vscode_id, keywords)| {
        find_best(&ids, keywords).map(|relay_id| ModelMapping {
            vscode_id: vscode_id.to_string(),
            relay_id: relay_id.to_string(),
        })
    })
    .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SuggestedDefaults {
    pub opus: Option<String>,
    pub sonnet: Option<String>,
    pub haiku: Option<String>,
}

pub fn suggest_defaults(models: &[RelayModel]) -> SuggestedDefaults {
    let ids = ids(models);
    let pick = |keywords: &[&str]| find_best(&ids, keywords).map(str::to_string);
    SuggestedDefaults {
        opus: pick(OPUS_DEFAULT_KEYWORDS),
        sonnet: pick(SONNET_KEYWORDS),
        haiku: pick(HAIKU_KEYWORDS),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub models: Vec<RelayModel>,
    pub suggest_mappings: Vec<ModelMapping>,
    pub suggest_opus: Option<String>,
    pub suggest_sonnet: Option<String>,
    pub suggest_haiku: Option<String>,
}

pub fn detect(catalog: &dyn ModelCatalog) -> Result<Detection> {
    let models = catalog.list_models()?;
    let defaults = suggest_defaults(&models);
    Ok(Detection {
        suggest_mappings: suggest_mappings(&models),
        suggest_opus: defaults.opus,
        suggest_sonnet: defaults.sonnet,
        suggest_haiku: defaults.haiku,
        models,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        ModelCatalog, RelayClient, RelayModel, detect, find_best, models_url, suggest_mappings,
    };
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn models(ids: &[&str]) -> Vec<RelayModel> {
        ids.iter()
            .map(|id| RelayModel { id: id.to_string() })
            .collect()
    }

    /// Answers exactly one request with `status` and `body`, returning the
    /// request head it saw.
    fn serve_once(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind should work");
        let addr = listener.local_addr().expect("addr should work");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept should work");
            let mut head = Vec::new();
            let mut buf = [0_u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).expect("read should work");
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(response.as_bytes())
                .expect("write should work");
            String::from_utf8_lossy(&head).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn url_does_not_double_version() {
        assert_eq!(models_url("https://relay.test/"), "https://relay.test/v1/models");
        assert_eq!(models_url("https://relay.test/v1"), "https://relay.test/v1/models");
        assert_eq!(models_url("https://relay.test/v1/"), "https://relay.test/v1/models");
    }

    #[test]
    fn best_prefers_thinking_then_length() {
        let ids = [
            "claude-opus-4-6",
            "claude-opus-4-6-thinking",
            "claude-opus-4-6-20260101",
        ];
        assert_eq!(find_best(&ids, &["opus-4-6"]), Some("claude-opus-4-6-thinking"));

        let ids = ["claude-sonnet-4", "claude-sonnet-4-20250514"];
        assert_eq!(find_best(&ids, &["sonnet-4-5", "sonnet-4"]), Some("claude-sonnet-4-20250514"));
        assert_eq!(find_best(&ids, &["haiku"]), None);
    }

    #[test]
    fn mappings_skip_missing_tiers() {
        let found = suggest_mappings(&models(&["claude-opus-4-6", "claude-haiku-4-5-20251001"]));
        let pairs: Vec<(&str, &str)> = found
            .iter()
            .map(|m| (m.vscode_id.as_str(), m.relay_id.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("claude-opus-4.6", "claude-opus-4-6"),
                ("claude-haiku-4.5", "claude-haiku-4-5-20251001"),
            ]
        );
    }

    #[test]
    fn client_sends_bearer_and_sorts_models() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"data":[{"id":"claude-sonnet-4-5"},{"id":"claude-haiku-4-5"},{"id":"claude-opus-4-6-thinking"}]}"#,
        );

        let detection = detect(&RelayClient::new(format!("{base}/v1/"), "sk-test")).expect("detect should work");
        let head = server.join().expect("server thread should finish");

        assert!(head.starts_with("GET /v1/models HTTP/1.1\r\n"));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        let ids: Vec<&str> = detection.models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["claude-haiku-4-5", "claude-opus-4-6-thinking", "claude-sonnet-4-5"]);
        assert_eq!(detection.suggest_mappings.len(), 3);
        assert_eq!(detection.suggest_opus.as_deref(), Some("claude-opus-4-6-thinking"));

        let raw = serde_json::to_value(&detection).expect("serialize should work");
        assert_eq!(raw["suggest_haiku"], "claude-haiku-4-5");
    }

    #[test]
    fn non_success_status_is_an_error() {
        let (base, server) = serve_once("401 Unauthorized", r#"{"error":"bad key"}"#);
        let err = RelayClient::new(base, "nope")
            .list_models()
            .expect_err("request should fail");
        server.join().expect("server thread should finish");
        assert_eq!(err.to_string(), "relay returned HTTP 401");
    }
}
