//! Thin REST boundary for the dashboard: CRUD over the config file.
//!
//! Deliberately dumb — every handler loads the config, mutates it, and
//! persists it atomically. The running proxy notices through the mtime
//! watcher, so the dashboard can run in the same process or a separate one.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::routing::post;
use axum::routing::put;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::info;

use toolmux_core::config;
use toolmux_core::config::ServerEntry;
use toolmux_core::config::Settings;

pub const DEFAULT_DASHBOARD_PORT: u16 = 24690;

#[derive(Clone)]
struct DashboardState {
    toolmux_home: Arc<PathBuf>,
}

type ApiError = (StatusCode, Json<Value>);

fn internal_error(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

pub fn dashboard_app(toolmux_home: PathBuf) -> Router {
    let state = DashboardState {
        toolmux_home: Arc::new(toolmux_home),
    };
    Router::new()
        .route("/api/servers", get(list_servers).post(add_server))
        .route(
            "/api/servers/{name}",
            put(update_server).delete(delete_server),
        )
        .route("/api/servers/{name}/env/{key}", put(set_env))
        .route("/api/settings", put(put_settings))
        .route("/api/import", post(import_servers))
        .with_state(state)
}

pub async fn run_dashboard(toolmux_home: PathBuf, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("dashboard API listening on http://{addr}/api/servers");
    axum::serve(listener, dashboard_app(toolmux_home))
        .await
        .context("serving dashboard")?;
    Ok(())
}

async fn list_servers(
    State(state): State<DashboardState>,
) -> Result<Json<IndexMap<String, ServerEntry>>, ApiError> {
    let config = config::load_or_init(&state.toolmux_home);
    Ok(Json(config.servers))
}

#[derive(Debug, Deserialize)]
struct AddServerBody {
    name: String,
    #[serde(flatten)]
    entry: ServerEntry,
}

async fn add_server(
    State(state): State<DashboardState>,
    Json(body): Json<AddServerBody>,
) -> Result<StatusCode, ApiError> {
    let mut config = config::load_or_init(&state.toolmux_home);
    if config.servers.contains_key(&body.name) {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("server `{}` already exists", body.name) })),
        ));
    }
    config.servers.insert(body.name, body.entry);
    config::save(&config, &state.toolmux_home).map_err(internal_error)?;
    Ok(StatusCode::CREATED)
}

async fn update_server(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
    Json(entry): Json<ServerEntry>,
) -> Result<StatusCode, ApiError> {
    let mut config = config::load_or_init(&state.toolmux_home);
    if !config.servers.contains_key(&name) {
        return Err(not_found(&name));
    }
    config.servers.insert(name, entry);
    config::save(&config, &state.toolmux_home).map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_server(
    State(state): State<DashboardState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let mut config = config::load_or_init(&state.toolmux_home);
    if config.servers.shift_remove(&name).is_none() {
        return Err(not_found(&name));
    }
    config::save(&config, &state.toolmux_home).map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EnvValueBody {
    value: String,
}

async fn set_env(
    State(state): State<DashboardState>,
    Path((name, key)): Path<(String, String)>,
    Json(body): Json<EnvValueBody>,
) -> Result<StatusCode, ApiError> {
    let mut config = config::load_or_init(&state.toolmux_home);
    let Some(entry) = config.servers.get_mut(&name) else {
        return Err(not_found(&name));
    };
    entry.env.insert(key, body.value);
    config::save(&config, &state.toolmux_home).map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn put_settings(
    State(state): State<DashboardState>,
    Json(settings): Json<Settings>,
) -> Result<StatusCode, ApiError> {
    let mut config = config::load_or_init(&state.toolmux_home);
    config.settings = settings;
    config::save(&config, &state.toolmux_home).map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ImportBody {
    /// Accepts both this tool's `servers` shape and the `mcpServers` key
    /// found in editor host configs.
    #[serde(alias = "mcpServers", alias = "servers")]
    servers: IndexMap<String, ServerEntry>,
}

async fn import_servers(
    State(state): State<DashboardState>,
    Json(body): Json<ImportBody>,
) -> Result<Json<Value>, ApiError> {
    let mut config = config::load_or_init(&state.toolmux_home);
    let mut imported = 0usize;
    let mut skipped = Vec::new();
    for (name, entry) in body.servers {
        if config.servers.contains_key(&name) {
            skipped.push(name);
            continue;
        }
        config.servers.insert(name, entry);
        imported += 1;
    }
    config::save(&config, &state.toolmux_home).map_err(internal_error)?;
    Ok(Json(json!({ "imported": imported, "skipped": skipped })))
}

fn not_found(name: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("no server named `{name}`") })),
    )
}
