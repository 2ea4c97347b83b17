use modelrelay_config::{Config, ConfigStore, Target, TargetError, resolve_incoming_key};
use modelrelay_deploy::{DeployError, Deployer};
use modelrelay_models::{ModelCatalog, RelayClient, detect};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{error, warn};

pub type CatalogFactory = Box<dyn Fn(&Config) -> Box<dyn ModelCatalog> + Send + Sync>;

/// Shared by every connection the server handles.
pub struct AppContext {
    pub store: ConfigStore,
    pub deployer: Deployer,
    catalog: CatalogFactory,
}

fn relay_catalog(cfg: &Config) -> Box<dyn ModelCatalog> {
    Box::new(RelayClient::new(cfg.base_url.clone(), cfg.api_key.clone()))
}

impl AppContext {
    pub fn new(store: ConfigStore, deployer: Deployer) -> Self {
        Self::with_catalog(store, deployer, relay_catalog)
    }

    pub fn with_catalog<F>(store: ConfigStore, deployer: Deployer, catalog: F) -> Self
    where
        F: Fn(&Config) -> Box<dyn ModelCatalog> + Send + Sync + 'static,
    {
        Self {
            store,
            deployer,
            catalog: Box::new(catalog),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, json!({ "status": "error", "message": message.into() }))
    }

    fn message(status: u16, message: impl Into<String>) -> Self {
        Self::new(status, json!({ "status": "ok", "message": message.into() }))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.body).unwrap_or_default()
    }
}

type Reply = Result<ApiResponse, ApiResponse>;

#[derive(Deserialize)]
struct TargetRequest {
    target_name: String,
}

/// Routes one `/api` request. `path` is already percent-decoded and has no
/// query string.
pub fn handle(ctx: &AppContext, method: &str, path: &str, body: &[u8]) -> ApiResponse {
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    let reply = match (path, method) {
        ("/api/config", "GET") => get_config(ctx),
        ("/api/config", "PUT") => put_config(ctx, body),
        ("/api/models/detect", "GET") => detect_models(ctx),
        ("/api/deploy", "POST") => deploy(ctx, body),
        ("/api/deploy/status", "POST") => deploy_status(ctx, body),
        ("/api/deploy/restore", "POST") => restore(ctx, body),
        ("/api/targets", "GET") => list_targets(ctx),
        ("/api/targets", "POST") => add_target(ctx, body),
        (
            "/api/config" | "/api/models/detect" | "/api/deploy" | "/api/deploy/status"
            | "/api/deploy/restore" | "/api/targets",
            _,
        ) => Err(method_not_allowed(method, path)),
        _ => match path.strip_prefix("/api/targets/") {
            Some(name) if !name.contains('/') => {
                if method == "DELETE" {
                    delete_target(ctx, name)
                } else {
                    Err(method_not_allowed(method, path))
                }
            }
            _ => Err(ApiResponse::error(404, format!("no API route for {path}"))),
        },
    };
    reply.unwrap_or_else(|response| response)
}

fn method_not_allowed(method: &str, path: &str) -> ApiResponse {
    ApiResponse::error(405, format!("method {method} not allowed on {path}"))
}

fn internal(err: anyhow::Error) -> ApiResponse {
    error!(error = ?err, "api request failed");
    ApiResponse::error(500, format!("{err:#}"))
}

fn target_error(err: &TargetError) -> ApiResponse {
    let status = match err {
        TargetError::Invalid(_) | TargetError::Protected(_) => 400,
        TargetError::NotFound(_) => 404,
        TargetError::Duplicate(_) => 409,
    };
    ApiResponse::error(status, err.to_string())
}

fn update_error(err: anyhow::Error) -> ApiResponse {
    match err.downcast_ref::<TargetError>() {
        Some(target_err) => target_error(target_err),
        None => internal(err),
    }
}

fn deploy_error(err: DeployError) -> ApiResponse {
    warn!(target_name = %err.target, step = %err.step, error = %err.source, "deploy flow failed");
    let mut response = ApiResponse::error(500, err.to_string());
    response.body["step"] = json!(err.step);
    response
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiResponse> {
    serde_json::from_slice(body).map_err(|err| ApiResponse::error(400, format!("invalid JSON: {err}")))
}

fn to_json<T: Serialize>(status: u16, value: &T) -> Reply {
    serde_json::to_value(value)
        .map(|body| ApiResponse::new(status, body))
        .map_err(|err| internal(err.into()))
}

fn load_config(ctx: &AppContext) -> Result<Config, ApiResponse> {
    ctx.store.load().map_err(internal)
}

/// Resolves the `{target_name}` body shared by the deploy routes.
fn requested_target(ctx: &AppContext, body: &[u8]) -> Result<(Config, Target), ApiResponse> {
    let request: TargetRequest = parse_json(body)?;
    let name = request.target_name.trim();
    if name.is_empty() {
        return Err(ApiResponse::error(400, "target_name is required"));
    }
    let cfg = load_config(ctx)?;
    let target = cfg
        .find_target(name)
        .cloned()
        .ok_or_else(|| target_error(&TargetError::NotFound(name.to_string())))?;
    Ok((cfg, target))
}

fn get_config(ctx: &AppContext) -> Reply {
    to_json(200, &load_config(ctx)?.masked())
}

fn put_config(ctx: &AppContext, body: &[u8]) -> Reply {
    let mut incoming: Config = parse_json(body)?;
    let targets = std::mem::take(&mut incoming.targets);
    incoming
        .replace_targets(targets)
        .map_err(|err| ApiResponse::error(400, err.to_string()))?;
    ctx.store
        .update(|cfg| {
            let api_key = resolve_incoming_key(incoming.api_key.clone(), &cfg.api_key);
            *cfg = Config { api_key, ..incoming };
            Ok(())
        })
        .map_err(internal)?;
    Ok(ApiResponse::message(200, "config saved"))
}

fn detect_models(ctx: &AppContext) -> Reply {
    let cfg = load_config(ctx)?;
    if cfg.base_url.trim().is_empty() || cfg.api_key.is_empty() {
        return Err(ApiResponse::error(400, "base_url and api_key must be configured first"));
    }
    let catalog = (ctx.catalog)(&cfg);
    let detection = detect(catalog.as_ref()).map_err(|err| {
        warn!(error = ?err, "model detection failed");
        ApiResponse::error(502, format!("model detection failed: {err:#}"))
    })?;
    to_json(200, &detection)
}

fn deploy(ctx: &AppContext, body: &[u8]) -> Reply {
    let (cfg, target) = requested_target(ctx, body)?;
    let report = ctx.deployer.deploy(&target, &cfg).map_err(deploy_error)?;
    Ok(ApiResponse::new(
        200,
        json!({
            "status": "ok",
            "message": format!("deployed to {}", target.name),
            "report": report,
        }),
    ))
}

fn deploy_status(ctx: &AppContext, body: &[u8]) -> Reply {
    let (_, target) = requested_target(ctx, body)?;
    let status = ctx.deployer.status(&target).map_err(deploy_error)?;
    to_json(200, &status)
}

fn restore(ctx: &AppContext, body: &[u8]) -> Reply {
    let (_, target) = requested_target(ctx, body)?;
    let report = ctx.deployer.restore(&target).map_err(deploy_error)?;
    Ok(ApiResponse::new(
        200,
        json!({
            "status": "ok",
            "message": format!("restored {}", target.name),
            "report": report,
        }),
    ))
}

fn list_targets(ctx: &AppContext) -> Reply {
    to_json(200, &load_config(ctx)?.targets)
}

fn add_target(ctx: &AppContext, body: &[u8]) -> Reply {
    let target: Target = parse_json(body)?;
    let name = target.name.clone();
    ctx.store
        .update(|cfg| {
            cfg.add_target(target)?;
            Ok(())
        })
        .map_err(update_error)?;
    Ok(ApiResponse::message(201, format!("target added: {name}")))
}

fn delete_target(ctx: &AppContext, name: &str) -> Reply {
    ctx.store
        .update(|cfg| Ok(cfg.remove_target(name)?))
        .map_err(update_error)?;
    Ok(ApiResponse::message(200, format!("target deleted: {name}")))
}
