use assert_cmd::Command;
use insta::assert_snapshot;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const BUNDLE: &str = concat!(
    r#"import{createRequire as cr}from"node:module";"#,
    r#"function Gu(A){return A.replace(/\[(1|2)m\]/gi,"")}"#,
    r#"async function nH({apiKey:A,maxRetries:Q,model:B,fetchOverride:G}){let Z=new Client(A,B);return Z}"#,
);

fn modelrelay(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("modelrelay"));
    cmd.env("MODELRELAY_CONFIG", dir.join("config.json"))
        .env("HOME", dir.join("home"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn fresh_config_lists_only_local() {
    let dir = tempdir().expect("tempdir should work");
    modelrelay(dir.path())
        .args(["targets", "list"])
        .assert()
        .success()
        .stdout("local (local)\n");
}

#[test]
fn targets_add_and_remove() {
    let dir = tempdir().expect("tempdir should work");
    modelrelay(dir.path())
        .args(["targets", "add", "staging", "--type", "ssh", "--host", "build01"])
        .assert()
        .success()
        .stdout(contains("added target staging"));

    let output = modelrelay(dir.path())
        .args(["targets", "list"])
        .output()
        .expect("command should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    assert_snapshot!("targets_list_stdout", stdout);

    modelrelay(dir.path())
        .args(["targets", "add", "staging", "--type", "remote-shell", "--host", "other"])
        .assert()
        .failure()
        .stderr(contains("target already exists: staging"));

    modelrelay(dir.path())
        .args(["targets", "remove", "staging"])
        .assert()
        .success();
    modelrelay(dir.path())
        .args(["targets", "list"])
        .assert()
        .success()
        .stdout(contains("staging").not());
}

#[test]
fn targets_add_validates_input() {
    let dir = tempdir().expect("tempdir should work");
    modelrelay(dir.path())
        .args(["targets", "add", "cs", "--type", "remote-codespace"])
        .assert()
        .failure()
        .stderr(contains("requires a host"));

    modelrelay(dir.path())
        .args(["targets", "add", "x", "--type", "carrier-pigeon", "--host", "h"])
        .assert()
        .failure()
        .stderr(contains("unknown target type"));

    modelrelay(dir.path())
        .args(["targets", "remove", "local"])
        .assert()
        .failure()
        .stderr(contains("cannot delete local target"));
    assert!(!dir.path().join("config.json").exists());
}

#[test]
fn config_show_masks_api_key() {
    let dir = tempdir().expect("tempdir should work");
    fs::write(
        dir.path().join("config.json"),
        r#"{"api_key":"sk-ANT-abcdef1234567890","base_url":"https://relay.example.test"}"#,
    )
    .expect("write should work");

    modelrelay(dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(contains(r#""api_key": "sk-ANT-a***************""#))
        .stdout(contains("abcdef1234567890").not());
}

#[test]
fn explicit_config_flag_wins_over_env() {
    let dir = tempdir().expect("tempdir should work");
    let explicit = dir.path().join("explicit.json");
    modelrelay(dir.path())
        .args(["--config", explicit.to_str().expect("path utf8"), "config", "path"])
        .assert()
        .success()
        .stdout(contains("explicit.json"));
}

#[test]
fn status_of_missing_bundle_reports_not_found() {
    let dir = tempdir().expect("tempdir should work");
    modelrelay(dir.path())
        .args(["status", "local"])
        .assert()
        .success()
        .stdout(contains(r#""path": "not found""#))
        .stdout(contains(r#""patched": false"#));
}

#[test]
fn deploy_then_restore_local_bundle() {
    let dir = tempdir().expect("tempdir should work");
    let dist = dir
        .path()
        .join("home/.vscode-server/extensions/github.copilot-chat-0.31.0/dist");
    fs::create_dir_all(&dist).expect("mkdir should work");
    let cli = dist.join("cli.js");
    fs::write(&cli, BUNDLE).expect("write should work");

    modelrelay(dir.path())
        .args(["deploy", "local"])
        .assert()
        .success()
        .stdout(contains(r#""backup_created": true"#))
        .stdout(contains("client-factory"));
    assert!(
        fs::read_to_string(&cli)
            .expect("read should work")
            .contains("/* modelrelay-cli-patch */")
    );
    assert!(dir.path().join("home/.claude/settings.json").is_file());

    modelrelay(dir.path())
        .args(["restore", "local"])
        .assert()
        .success()
        .stdout(contains(r#""state": "restored""#));
    assert_eq!(fs::read_to_string(&cli).expect("read should work"), BUNDLE);
}

#[test]
fn deploy_failures_name_the_step() {
    let dir = tempdir().expect("tempdir should work");
    modelrelay(dir.path())
        .args(["deploy", "ghost"])
        .assert()
        .failure()
        .stderr(contains("target not found: ghost"));

    modelrelay(dir.path())
        .args(["deploy", "local"])
        .assert()
        .failure()
        .stderr(contains("locate failed for target local"));
}
