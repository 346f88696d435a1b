use assert_cmd::prelude::*;
use std::{fs, process::Command};
use tempfile::TempDir;

const SECRET: &str = "0101010101010101010101010101010101010101010101010101010101010101";

fn write_env(dir: &TempDir, extra: &str) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        "STORE_ROOT={}\nACK_TIMEOUT_MS=300\nHANDOFF_TIMEOUT_MS=100\nHANDOFF_POLL_MS=20\nVERIFY_SIG=1\n{extra}",
        dir.path().display()
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

fn crosspost(env_path: &str, args: &[&str]) -> assert_cmd::assert::Assert {
    Command::cargo_bin("crosspost")
        .unwrap()
        .env_remove("STORE_ROOT")
        .env_remove("SECRET_KEY")
        .args(["--env", env_path])
        .args(args)
        .assert()
}

#[test]
fn init_then_list_prints_default_relays() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "");

    crosspost(&env_path, &["init"]).success();
    assert!(dir.path().join("kv").is_dir());

    let out = crosspost(&env_path, &["relay", "list"]).success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).unwrap();
    assert_eq!(stdout.lines().count(), 5);
    assert!(stdout.lines().all(|l| l.starts_with("wss://")));
}

#[test]
fn relay_set_rejects_plain_ws_by_default() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "");
    crosspost(&env_path, &["relay", "set", "ws://127.0.0.1:1"]).failure();
    crosspost(&env_path, &["relay", "set", "wss://a.example, wss://b.example"]).success();

    let out = crosspost(&env_path, &["relay", "list"]).success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).unwrap();
    assert_eq!(stdout, "wss://a.example\nwss://b.example\n");
}

#[test]
fn quota_reports_and_switches_tier() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "");

    let out = crosspost(&env_path, &["quota"]).success();
    let info: serde_json::Value = serde_json::from_slice(&out.get_output().stdout).unwrap();
    assert_eq!(info["tier"], "basic");
    assert_eq!(info["used"], 0);
    assert_eq!(info["can_publish"], true);

    let out = crosspost(&env_path, &["quota", "--set-tier", "advanced"]).success();
    let info: serde_json::Value = serde_json::from_slice(&out.get_output().stdout).unwrap();
    assert_eq!(info["tier"], "advanced");

    crosspost(&env_path, &["quota", "--set-tier", "gold"]).failure();
}

#[test]
fn publish_with_only_dead_relays_fails() {
    let dir = TempDir::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);
    let env_path = write_env(
        &dir,
        &format!("ALLOW_INSECURE_RELAYS=1\nCONNECT_TIMEOUT_MS=500\nSECRET_KEY={SECRET}\n"),
    );
    crosspost(&env_path, &["relay", "set", &dead]).success();

    let out = crosspost(&env_path, &["publish", "--text", "hi"]).failure();
    let outcome: serde_json::Value = serde_json::from_slice(&out.get_output().stdout).unwrap();
    assert_eq!(outcome["overall_success"], false);
    assert_eq!(outcome["success_count"], 0);
    assert_eq!(outcome["total"], 1);

    let out = crosspost(&env_path, &["quota"]).success();
    let info: serde_json::Value = serde_json::from_slice(&out.get_output().stdout).unwrap();
    assert_eq!(info["used"], 0);
}

#[test]
fn publish_without_secret_key_fails() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, "");
    crosspost(&env_path, &["publish", "--text", "hi"]).failure();
}
