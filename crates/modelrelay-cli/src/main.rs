mod api;
mod server;

use anyhow::{Context, Result, anyhow};
use api::AppContext;
use clap::{Parser, Subcommand};
use modelrelay_config::{Config, ConfigStore, Target, TargetKind, parse_target_kind};
use modelrelay_deploy::Deployer;
use modelrelay_models::{RelayClient, detect};
use serde::Serialize;
use server::{DEFAULT_ADDR, ServerConfig, open_url_in_default_browser, start_server};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "modelrelay",
    version,
    about = "Point an editor's coding agent at a model relay"
)]
struct Cli {
    /// Config file. Defaults to $MODELRELAY_CONFIG, then ~/.modelrelay/config.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the control API and web UI.
    Serve {
        #[arg(long, default_value = DEFAULT_ADDR)]
        addr: String,
        #[arg(long)]
        no_browser: bool,
        /// Serve UI files from this directory instead of the built-in page.
        #[arg(long)]
        web_root: Option<PathBuf>,
    },
    /// Patch a target's agent bundle and write its settings.
    Deploy { target: String },
    /// Show the patch state of a target.
    Status { target: String },
    /// Put a target's pristine bundle back.
    Restore { target: String },
    /// Manage deployment targets.
    Targets {
        #[command(subcommand)]
        command: TargetCommands,
    },
    /// Inspect the configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Ask the relay which models it serves and suggest mappings.
    Detect,
}

#[derive(Debug, Subcommand)]
enum TargetCommands {
    List,
    Add {
        name: String,
        #[arg(long = "type", value_parser = parse_kind_arg)]
        kind: TargetKind,
        #[arg(long)]
        host: Option<String>,
    },
    Remove { name: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Print the configuration with the API key masked.
    Show,
    /// Print the config file location.
    Path,
}

fn parse_kind_arg(input: &str) -> Result<TargetKind, String> {
    parse_target_kind(input).ok_or_else(|| {
        format!("unknown target type '{input}' (expected local, remote-shell or remote-codespace)")
    })
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(
        "modelrelay=info"
            .parse()
            .context("invalid default log directive")?,
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed serializing output")?
    );
    Ok(())
}

fn lookup_target(cfg: &Config, name: &str) -> Result<Target> {
    cfg.find_target(name)
        .cloned()
        .ok_or_else(|| anyhow!("target not found: {name}"))
}

fn serve_command(store: ConfigStore, addr: String, no_browser: bool, web_root: Option<PathBuf>) -> Result<()> {
    let ctx = Arc::new(AppContext::new(store, Deployer::from_home_dir()?));
    let config = ServerConfig { addr, web_root };
    let server = start_server(&config, ctx)?;

    println!("modelrelay running at {}", server.url);
    if !no_browser {
        if let Err(err) = open_url_in_default_browser(&server.url) {
            warn!(error = %err, "could not open browser");
        }
    }
    server.wait();
    Ok(())
}

fn targets_command(store: &ConfigStore, command: TargetCommands) -> Result<()> {
    match command {
        TargetCommands::List => {
            for target in store.load()?.targets {
                match target.host {
                    Some(host) => println!("{} ({}, {host})", target.name, target.kind.as_str()),
                    None => println!("{} ({})", target.name, target.kind.as_str()),
                }
            }
        }
        TargetCommands::Add { name, kind, host } => {
            let target = Target {
                name: name.clone(),
                kind,
                host: host.filter(|host| !host.trim().is_empty()),
            };
            store.update(|cfg| {
                cfg.add_target(target)?;
                Ok(())
            })?;
            println!("added target {name}");
        }
        TargetCommands::Remove { name } => {
            store.update(|cfg| Ok(cfg.remove_target(&name)?))?;
            println!("removed target {name}");
        }
    }
    Ok(())
}

fn detect_command(store: &ConfigStore) -> Result<()> {
    let cfg = store.load()?;
    if cfg.base_url.trim().is_empty() || cfg.api_key.is_empty() {
        return Err(anyhow!("base_url and api_key must be configured first"));
    }
    let detection = detect(&RelayClient::new(cfg.base_url, cfg.api_key))?;
    print_json(&detection)
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let store = ConfigStore::new(ConfigStore::resolve_path(cli.config.as_deref())?);

    match cli.command {
        Commands::Serve {
            addr,
            no_browser,
            web_root,
        } => serve_command(store, addr, no_browser, web_root),
        Commands::Deploy { target } => {
            let cfg = store.load()?;
            let target = lookup_target(&cfg, &target)?;
            print_json(&Deployer::from_home_dir()?.deploy(&target, &cfg)?)
        }
        Commands::Status { target } => {
            let target = lookup_target(&store.load()?, &target)?;
            print_json(&Deployer::from_home_dir()?.status(&target)?)
        }
        Commands::Restore { target } => {
            let target = lookup_target(&store.load()?, &target)?;
            print_json(&Deployer::from_home_dir()?.restore(&target)?)
        }
        Commands::Targets { command } => targets_command(&store, command),
        Commands::Config { command } => match command {
            ConfigCommands::Show => print_json(&store.load()?.masked()),
            ConfigCommands::Path => {
                println!("{}", store.path().display());
                Ok(())
            }
        },
        Commands::Detect => detect_command(&store),
    }
}
