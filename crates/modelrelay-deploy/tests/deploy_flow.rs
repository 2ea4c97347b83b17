use modelrelay_config::{Config, Target};
use modelrelay_deploy::{DeployState, DeployStep, Deployer, Discovery, NOT_FOUND_PATH};
use modelrelay_patch::{LEGACY_PATCH_MARKER, PATCH_MARKER, backup_path_for};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

const BUNDLE: &str = concat!(
    r#"import{createRequire as cr}from"node:module";"#,
    r#"function Gu(A){return A.replace(/\[(1|2)m\]/gi,"")}"#,
    r#"async function nH({apiKey:A,maxRetries:Q,model:B,fetchOverride:G}){let Z=new Client(A,B);return Z}"#,
    r#"async function*stream(A,Q,B){let G=open(B);for await(let Y of G)yield{model:B.model,Y}}"#,
);

fn dist(home: &Path) -> PathBuf {
    let dist = home.join(".vscode-server/extensions/github.copilot-chat-0.31.0/dist");
    fs::create_dir_all(&dist).expect("mkdir should work");
    dist
}

fn install_legacy(dist: &Path) -> PathBuf {
    let ext = dist.join("extension.js");
    fs::write(&ext, format!("module.exports={{}};\n{LEGACY_PATCH_MARKER}\n;hook();")).expect("write should work");
    fs::write(backup_path_for(&ext), "module.exports={};").expect("write should work");
    ext
}

#[test]
fn local_deploy_status_restore_cycle() {
    let home = tempdir().expect("tempdir should work");
    let dist = dist(home.path());
    let cli = dist.join("cli.js");
    fs::write(&cli, BUNDLE).expect("write should work");
    let ext = install_legacy(&dist);

    let cfg = Config {
        api_key: "sk-relay-0123456789".to_string(),
        base_url: "https://relay.example.test".to_string(),
        ..Config::default()
    };
    let deployer = Deployer::new(home.path());
    let target = Target::local();

    let report = deployer.deploy(&target, &cfg).expect("deploy should work");
    assert_eq!(report.state, DeployState::SettingsWritten);
    assert_eq!(report.discovery, Discovery::Adaptive);
    assert_eq!(report.applied.len(), 3);
    assert!(report.backup_created);
    assert!(report.legacy_cleaned);
    assert_eq!(fs::read_to_string(&ext).expect("read should work"), "module.exports={};");

    let patched = fs::read_to_string(&cli).expect("read should work");
    assert!(patched.contains(r#""claude-opus-4.6":"claude-opus-4-6""#));

    let agent: Value = serde_json::from_str(
        &fs::read_to_string(home.path().join(".claude/settings.json")).expect("read should work"),
    )
    .expect("agent settings should be json");
    assert_eq!(agent["env"]["ANTHROPIC_BASE_URL"], "https://relay.example.test");
    assert!(home.path().join(".config/Code/User/settings.json").is_file());

    let status = deployer.status(&target).expect("status should work");
    assert!(status.patched);
    assert!(status.backup_exists);
    assert!(status.settings_exist);
    assert_eq!(status.path, cli.display().to_string());
    assert_eq!(status.legacy_path, Some(ext.display().to_string()));
    assert!(!status.legacy_patched);

    let restored = deployer.restore(&target).expect("restore should work");
    assert_eq!(restored.state, DeployState::Restored);
    assert_eq!(fs::read_to_string(&cli).expect("read should work"), BUNDLE);
    assert!(!deployer.status(&target).expect("status should work").patched);
}

#[test]
fn redeploy_reuses_pristine_backup() {
    let home = tempdir().expect("tempdir should work");
    let cli = dist(home.path()).join("cli.js");
    fs::write(&cli, BUNDLE).expect("write should work");
    let deployer = Deployer::new(home.path());

    deployer
        .deploy(&Target::local(), &Config::default())
        .expect("first deploy should work");
    let second = deployer
        .deploy(&Target::local(), &Config::default())
        .expect("second deploy should work");

    assert!(!second.backup_created);
    assert!(!second.legacy_cleaned);
    let patched = fs::read_to_string(&cli).expect("read should work");
    assert_eq!(patched.matches(PATCH_MARKER).count(), 1);
    assert_eq!(
        fs::read_to_string(backup_path_for(&cli)).expect("read should work"),
        BUNDLE
    );
}

#[test]
fn missing_bundle_fails_at_locate() {
    let home = tempdir().expect("tempdir should work");
    let deployer = Deployer::new(home.path());

    let err = deployer
        .deploy(&Target::local(), &Config::default())
        .expect_err("deploy should fail");
    assert_eq!(err.step, DeployStep::Locate);
    assert!(err.is_not_found());
    assert!(!home.path().join(".claude").exists());

    let status = deployer.status(&Target::local()).expect("status should work");
    assert_eq!(status.path, NOT_FOUND_PATH);
    assert!(!status.patched);
    assert_eq!(status.legacy_path, None);
}

#[test]
fn unknown_bundle_format_fails_at_patch_without_side_effects() {
    let home = tempdir().expect("tempdir should work");
    let cli = dist(home.path()).join("cli.js");
    let original = r#"import{createRequire as cr}from"node:module";function other(){}"#;
    fs::write(&cli, original).expect("write should work");

    let err = Deployer::new(home.path())
        .deploy(&Target::local(), &Config::default())
        .expect_err("deploy should fail");
    assert_eq!(err.step, DeployStep::Patch);
    assert!(err.to_string().starts_with("patch failed for target local:"));
    assert_eq!(fs::read_to_string(&cli).expect("read should work"), original);
    assert!(!backup_path_for(&cli).exists());
    assert!(!home.path().join(".claude/settings.json").exists());
}

#[test]
fn restore_without_backup_fails_at_restore() {
    let home = tempdir().expect("tempdir should work");
    let cli = dist(home.path()).join("cli.js");
    fs::write(&cli, BUNDLE).expect("write should work");

    let err = Deployer::new(home.path())
        .restore(&Target::local())
        .expect_err("restore should fail");
    assert_eq!(err.step, DeployStep::Restore);
    assert!(err.is_not_found());
    assert_eq!(fs::read_to_string(&cli).expect("read should work"), BUNDLE);
}
