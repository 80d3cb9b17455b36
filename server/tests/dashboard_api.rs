//! REST boundary tests: every mutation lands in the config file.

use serde_json::Value;
use serde_json::json;
use toolmux_core::config;

async fn start_dashboard() -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = toolmux_server::dashboard::dashboard_app(dir.path().to_path_buf());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), dir)
}

#[tokio::test]
async fn server_crud_round_trips_through_the_config_file() {
    let (base, dir) = start_dashboard().await;
    let http = reqwest::Client::new();

    let created = http
        .post(format!("{base}/api/servers"))
        .json(&json!({ "name": "git", "command": "mcp-git", "args": ["--stdio"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);

    // Duplicate insert conflicts.
    let duplicate = http
        .post(format!("{base}/api/servers"))
        .json(&json!({ "name": "git", "command": "other" }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    let listed: Value = http
        .get(format!("{base}/api/servers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["git"]["command"], json!("mcp-git"));

    let env_set = http
        .put(format!("{base}/api/servers/git/env/GIT_TOKEN"))
        .json(&json!({ "value": "secret" }))
        .send()
        .await
        .unwrap();
    assert_eq!(env_set.status(), 204);

    let config = config::load_or_init(dir.path());
    assert_eq!(config.servers["git"].env["GIT_TOKEN"], "secret");

    let deleted = http
        .delete(format!("{base}/api/servers/git"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
    let config = config::load_or_init(dir.path());
    assert!(config.servers.is_empty());
}

#[tokio::test]
async fn settings_and_import_endpoints_mutate_the_file() {
    let (base, dir) = start_dashboard().await;
    let http = reqwest::Client::new();

    let settings = http
        .put(format!("{base}/api/settings"))
        .json(&json!({ "mode": "tool-search", "prefixTools": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(settings.status(), 204);

    let imported: Value = http
        .post(format!("{base}/api/import"))
        .json(&json!({
            "mcpServers": {
                "fs": { "command": "mcp-fs" },
                "git": { "command": "mcp-git" }
            }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(imported["imported"], json!(2));

    let config = config::load_or_init(dir.path());
    assert_eq!(config.settings.mode, toolmux_core::config::Mode::ToolSearch);
    assert!(config.settings.prefix_tools);
    assert_eq!(config.servers.len(), 2);
}

#[tokio::test]
async fn unknown_server_mutations_are_not_found() {
    let (base, _dir) = start_dashboard().await;
    let http = reqwest::Client::new();

    let updated = http
        .put(format!("{base}/api/servers/ghost"))
        .json(&json!({ "command": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(updated.status(), 404);

    let deleted = http
        .delete(format!("{base}/api/servers/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 404);
}
