use assert_cmd::prelude::*;
use serde_json::Value;
use std::fs;
use std::process::Command;

fn toolmux(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("toolmux").unwrap();
    cmd.env("TOOLMUX_HOME", home);
    cmd.env_remove("MCP_ON_DEMAND_MODE");
    cmd.env_remove("MCP_ON_DEMAND_PRELOAD");
    cmd
}

#[test]
fn status_creates_a_default_config_on_first_run() {
    let home = tempfile::tempdir().unwrap();
    let assert = toolmux(home.path()).arg("status").assert().success();
    let out = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(out.contains("no servers configured"), "stdout: {out}");
    assert!(home.path().join("config.json").exists());
}

#[test]
fn status_json_lists_configured_servers_and_cache_state() {
    let home = tempfile::tempdir().unwrap();
    fs::create_dir_all(home.path()).unwrap();
    fs::write(
        home.path().join("config.json"),
        r#"{
            "settings": { "mode": "tool-search" },
            "servers": {
                "echo": { "command": "mcp-echo", "args": ["--fast"] }
            }
        }"#,
    )
    .unwrap();

    let assert = toolmux(home.path())
        .args(["status", "--json"])
        .assert()
        .success();
    let out = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let v: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(v["mode"], serde_json::json!("tool-search"));
    assert_eq!(v["servers"][0]["name"], serde_json::json!("echo"));
    assert_eq!(v["cache"]["present"], serde_json::json!(false));
}

#[test]
fn reset_deletes_the_cache_file() {
    let home = tempfile::tempdir().unwrap();
    fs::create_dir_all(home.path()).unwrap();
    fs::write(home.path().join("schema-cache.json"), "{}").unwrap();

    toolmux(home.path()).arg("reset").assert().success();
    assert!(!home.path().join("schema-cache.json").exists());

    // Idempotent.
    toolmux(home.path()).arg("reset").assert().success();
}

#[test]
fn search_with_no_cache_reports_an_empty_index() {
    let home = tempfile::tempdir().unwrap();
    let assert = toolmux(home.path())
        .args(["search", "anything"])
        .assert()
        .success();
    let out = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(out.contains("index is empty"), "stdout: {out}");
}

#[test]
fn search_finds_tools_in_a_seeded_cache() {
    let home = tempfile::tempdir().unwrap();
    fs::create_dir_all(home.path()).unwrap();
    fs::write(
        home.path().join("config.json"),
        r#"{ "servers": { "git": { "command": "mcp-git" } } }"#,
    )
    .unwrap();
    fs::write(
        home.path().join("schema-cache.json"),
        serde_json::to_string(&serde_json::json!({
            "version": 1,
            "generatedAt": "2026-01-05T12:00:00Z",
            "servers": {
                "git": {
                    "serverName": "git",
                    "cachedAt": "2026-01-05T12:00:00Z",
                    "tools": [
                        {
                            "name": "git_commit",
                            "description": "Create a commit",
                            "inputSchema": { "type": "object" }
                        }
                    ]
                }
            }
        }))
        .unwrap(),
    )
    .unwrap();

    let assert = toolmux(home.path())
        .args(["search", "commit"])
        .assert()
        .success();
    let out = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(out.contains("git/git_commit"), "stdout: {out}");
}

#[test]
fn generate_exits_nonzero_when_a_server_fails() {
    let home = tempfile::tempdir().unwrap();
    fs::create_dir_all(home.path()).unwrap();
    fs::write(
        home.path().join("config.json"),
        r#"{ "servers": { "ghost": { "command": "/nonexistent/toolmux-test-binary" } } }"#,
    )
    .unwrap();

    toolmux(home.path()).arg("generate").assert().failure();
}

#[test]
fn generate_with_no_servers_succeeds() {
    let home = tempfile::tempdir().unwrap();
    toolmux(home.path()).arg("generate").assert().success();
}
