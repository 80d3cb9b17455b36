//! User configuration: the federated-server list and global settings.
//!
//! One JSON document under the toolmux home directory is authoritative; every
//! component works from an immutable snapshot of it. Unknown keys — at the
//! top level, inside `settings`, and inside each server entry — are captured
//! in flatten maps so a dashboard write-back never loses fields this version
//! does not model.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::error::ProxyError;

pub const CONFIG_JSON_FILE: &str = "config.json";

/// `TOOLMUX_HOME` overrides the default `~/.toolmux`.
pub const TOOLMUX_HOME_ENV_VAR: &str = "TOOLMUX_HOME";

pub const MODE_ENV_VAR: &str = "MCP_ON_DEMAND_MODE";
pub const PRELOAD_ENV_VAR: &str = "MCP_ON_DEMAND_PRELOAD";
pub const DEBUG_ENV_VAR: &str = "MCP_ON_DEMAND_DEBUG";

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SSE_IDLE_TIMEOUT_SECS: u64 = 900;

/// Spawn instructions for one upstream MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Overlaid on the proxy's inherited environment; entry values win.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preload: bool,
    /// Seconds; overrides the global idle timeout.
    #[serde(
        rename = "idleTimeout",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_timeout: Option<u64>,
    /// Never idle-reaped when true.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub persistent: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    Passthrough,
    ToolSearch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadKeyword {
    All,
    None,
}

/// Which servers to warm after the host-facing transport is up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Preload {
    Keyword(PreloadKeyword),
    Servers(Vec<String>),
}

impl Default for Preload {
    fn default() -> Self {
        Preload::Keyword(PreloadKeyword::None)
    }
}

impl Preload {
    /// Resolve to concrete server names; an explicit list is intersected
    /// with the configured set.
    pub fn select(&self, configured: &[String]) -> Vec<String> {
        match self {
            Preload::Keyword(PreloadKeyword::None) => Vec::new(),
            Preload::Keyword(PreloadKeyword::All) => configured.to_vec(),
            Preload::Servers(names) => configured
                .iter()
                .filter(|name| names.contains(name))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Seconds of inactivity before a child is reaped.
    #[serde(rename = "idleTimeout", default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Milliseconds allowed for spawn + initialize handshake.
    #[serde(rename = "startupTimeout", default = "default_startup_timeout")]
    pub startup_timeout: u64,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub preload: Preload,
    #[serde(rename = "prefixTools", default)]
    pub prefix_tools: bool,
    #[serde(rename = "cacheDir", default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(rename = "logLevel", default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Seconds an SSE session may sit idle before the reaper closes it.
    #[serde(rename = "sseIdleTimeout", default = "default_sse_idle_timeout")]
    pub sse_idle_timeout: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_startup_timeout() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MS
}

fn default_sse_idle_timeout() -> u64 {
    DEFAULT_SSE_IDLE_TIMEOUT_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT_MS,
            mode: Mode::default(),
            preload: Preload::default(),
            prefix_tools: false,
            cache_dir: None,
            log_level: None,
            sse_idle_timeout: DEFAULT_SSE_IDLE_TIMEOUT_SECS,
            extra: serde_json::Map::new(),
        }
    }
}

impl Settings {
    pub fn startup_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.startup_timeout)
    }

    pub fn effective_idle_timeout(&self, entry: &ServerEntry) -> Duration {
        Duration::from_secs(entry.idle_timeout.unwrap_or(self.idle_timeout))
    }

    pub fn sse_idle_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.sse_idle_timeout)
    }

    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> String {
        if std::env::var(DEBUG_ENV_VAR).is_ok_and(|v| v == "1") {
            return "debug".to_string();
        }
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    /// Declared order matters: it decides the winner when two servers expose
    /// the same tool without prefixing.
    #[serde(default)]
    pub servers: IndexMap<String, ServerEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Config {
    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// `MCP_ON_DEMAND_MODE` and `MCP_ON_DEMAND_PRELOAD` override the file.
    pub fn apply_env_overrides(&mut self) {
        match std::env::var(MODE_ENV_VAR).ok().as_deref() {
            Some("discover") | Some("tool-search") => self.settings.mode = Mode::ToolSearch,
            Some("passthrough") => self.settings.mode = Mode::Passthrough,
            Some(other) => warn!("ignoring unrecognized {MODE_ENV_VAR}={other}"),
            None => {}
        }
        match std::env::var(PRELOAD_ENV_VAR).ok().as_deref() {
            Some("all") => self.settings.preload = Preload::Keyword(PreloadKeyword::All),
            Some("none") => self.settings.preload = Preload::Keyword(PreloadKeyword::None),
            Some(other) => warn!("ignoring unrecognized {PRELOAD_ENV_VAR}={other}"),
            None => {}
        }
    }

    /// Entries imported from host configs sometimes carry a `disabled` flag
    /// with no agreed semantics; every listed server is treated as enabled.
    pub fn warn_on_disabled_flags(&self) {
        for (name, entry) in &self.servers {
            if entry.extra.contains_key("disabled") {
                warn!(
                    "server `{name}` carries a `disabled` flag, which toolmux does not \
                     enforce; treating it as enabled (delete the entry to disable it)"
                );
            }
        }
    }
}

pub fn find_toolmux_home() -> io::Result<PathBuf> {
    if let Ok(home) = std::env::var(TOOLMUX_HOME_ENV_VAR) {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".toolmux"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not locate home directory"))
}

pub fn config_path(toolmux_home: &Path) -> PathBuf {
    toolmux_home.join(CONFIG_JSON_FILE)
}

/// Directory holding the schema cache; defaults to the toolmux home.
pub fn cache_dir(settings: &Settings, toolmux_home: &Path) -> PathBuf {
    settings
        .cache_dir
        .clone()
        .unwrap_or_else(|| toolmux_home.to_path_buf())
}

/// Load the config, creating a defaulted file on first run. A corrupt file
/// is reported and left on disk untouched; the proxy continues with
/// defaults rather than refusing to start.
pub fn load_or_init(toolmux_home: &Path) -> Config {
    let path = config_path(toolmux_home);
    let mut config = match std::fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str::<Config>(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("failed to parse {}: {e}; continuing with defaults", path.display());
                Config::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("{} not found, writing defaults", path.display());
            let config = Config::default();
            if let Err(e) = save(&config, toolmux_home) {
                warn!("failed to write default config: {e}");
            }
            config
        }
        Err(e) => {
            warn!("failed to read {}: {e}; continuing with defaults", path.display());
            Config::default()
        }
    };
    config.apply_env_overrides();
    config.warn_on_disabled_flags();
    config
}

/// Persist atomically: write a sibling temp file, then rename over the
/// target so concurrent readers see either the old document or the new one.
pub fn save(config: &Config, toolmux_home: &Path) -> crate::error::Result<()> {
    let path = config_path(toolmux_home);
    std::fs::create_dir_all(toolmux_home)
        .map_err(|e| ProxyError::Config(format!("creating {}: {e}", toolmux_home.display())))?;
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| ProxyError::Config(format!("serializing config: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .map_err(|e| ProxyError::Config(format!("writing {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, &path)
        .map_err(|e| ProxyError::Config(format!("renaming into {}: {e}", path.display())))?;
    Ok(())
}
