use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolmux_core::ChildManager;
use toolmux_core::ProxyHandler;
use toolmux_core::SchemaCache;
use toolmux_core::config;
use toolmux_core::config::Config;
use toolmux_core::config::Settings;
use toolmux_core::schema_cache::SCHEMA_CACHE_FILE;
use toolmux_core::search::IndexedTool;
use toolmux_core::search::SearchIndex;
use toolmux_server::DEFAULT_DASHBOARD_PORT;
use toolmux_server::DEFAULT_SSE_PORT;

#[derive(Debug, Parser)]
#[command(
    name = "toolmux",
    version,
    about = "Multiplexing proxy for Model Context Protocol servers",
    long_about = "Presents one MCP server to the host while federating many upstream MCP \
                  servers as lazily-spawned child processes.\n\nWith no subcommand, serves \
                  the proxy over stdio (the transport editors use)."
)]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve the proxy over loopback HTTP/SSE instead of stdio.
    Serve {
        #[arg(long, default_value_t = DEFAULT_SSE_PORT)]
        port: u16,
    },
    /// Spawn every configured server once, persist its tool schemas, and
    /// stop them. Exits non-zero if any server failed.
    Generate,
    /// Run the dashboard HTTP server.
    Dashboard {
        #[arg(long, default_value_t = DEFAULT_DASHBOARD_PORT)]
        port: u16,
    },
    /// Print configured servers and a cache summary.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Delete cached schema files.
    Reset,
    /// Query the tool index offline (diagnostics).
    Search {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn init_logging(settings: &Settings) {
    // stdout belongs to the protocol; logs go to stderr. `RUST_LOG` wins
    // over the configured level.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_filter())),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let toolmux_home = config::find_toolmux_home().context("resolving toolmux home")?;
    let config = config::load_or_init(&toolmux_home);
    init_logging(&config.settings);

    match cli.cmd {
        None => run_proxy_stdio(toolmux_home, config).await,
        Some(Command::Serve { port }) => run_proxy_sse(toolmux_home, config, port).await,
        Some(Command::Generate) => generate(&toolmux_home, config).await,
        Some(Command::Dashboard { port }) => {
            toolmux_server::run_dashboard(toolmux_home, port).await
        }
        Some(Command::Status { json }) => status(&toolmux_home, config, json).await,
        Some(Command::Reset) => reset(&toolmux_home, &config),
        Some(Command::Search { query, limit }) => {
            search(&toolmux_home, config, &query.join(" "), limit).await
        }
    }
}

fn build_handler(toolmux_home: &Path, config: Config) -> Arc<ProxyHandler> {
    let cache_dir = config::cache_dir(&config.settings, toolmux_home);
    let cache = Arc::new(SchemaCache::new(&cache_dir));
    let manager = ChildManager::new(&config);
    ProxyHandler::new(config, cache, manager)
}

async fn run_proxy_stdio(toolmux_home: PathBuf, config: Config) -> Result<()> {
    let handler = build_handler(&toolmux_home, config);
    handler.init().await;
    let watcher = toolmux_server::spawn_watcher(handler.clone(), toolmux_home);

    tokio::select! {
        result = toolmux_server::run_stdio(handler.clone()) => {
            result.context("stdio transport failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; stopping children");
            handler.manager().shutdown_all().await;
        }
    }
    watcher.abort();
    Ok(())
}

async fn run_proxy_sse(toolmux_home: PathBuf, config: Config, port: u16) -> Result<()> {
    let handler = build_handler(&toolmux_home, config);
    handler.init().await;
    let watcher = toolmux_server::spawn_watcher(handler.clone(), toolmux_home);

    tokio::select! {
        // Bind failure is fatal: the process exits non-zero.
        result = toolmux_server::run_sse(handler.clone(), port) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; stopping children");
            handler.manager().shutdown_all().await;
        }
    }
    watcher.abort();
    Ok(())
}

/// Start each configured server once, capture its tool list into the cache,
/// and stop everything again.
async fn generate(toolmux_home: &Path, config: Config) -> Result<()> {
    let names = config.server_names();
    if names.is_empty() {
        println!("no servers configured in {}", config::config_path(toolmux_home).display());
        return Ok(());
    }

    let cache_dir = config::cache_dir(&config.settings, toolmux_home);
    let cache = SchemaCache::new(&cache_dir);
    let manager = ChildManager::new(&config);

    let mut failures = Vec::new();
    for name in &names {
        match manager.discover_tools(name).await {
            Ok(tools) => {
                println!("{name}: {} tools", tools.len());
                cache.update_server(name, tools);
            }
            Err(e) => {
                eprintln!("{name}: {e}");
                failures.push(name.clone());
            }
        }
    }
    manager.shutdown_all().await;
    cache.save().await.context("persisting schema cache")?;
    println!(
        "cached {} tools from {}/{} servers into {}",
        cache.tool_count(),
        names.len() - failures.len(),
        names.len(),
        cache.cache_path().display()
    );

    if failures.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("failed to generate schemas for: {}", failures.join(", "));
    }
}

async fn status(toolmux_home: &Path, config: Config, json_out: bool) -> Result<()> {
    let cache_dir = config::cache_dir(&config.settings, toolmux_home);
    let cache = SchemaCache::new(&cache_dir);
    let loaded = matches!(
        cache.load().await,
        toolmux_core::schema_cache::CacheLoadOutcome::Loaded { .. }
    );

    if json_out {
        let servers: Vec<serde_json::Value> = config
            .servers
            .iter()
            .map(|(name, entry)| {
                json!({
                    "name": name,
                    "command": entry.command,
                    "args": entry.args,
                    "persistent": entry.persistent,
                    "cachedTools": cache.tools_for_server(name).map(|t| t.len()),
                })
            })
            .collect();
        let out = json!({
            "configPath": config::config_path(toolmux_home),
            "mode": config.settings.mode,
            "prefixTools": config.settings.prefix_tools,
            "cache": {
                "path": cache.cache_path(),
                "present": loaded,
                "tools": cache.tool_count(),
                "generatedAt": loaded.then(|| cache.generated_at()),
            },
            "servers": servers,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("config: {}", config::config_path(toolmux_home).display());
    println!(
        "mode: {}",
        match config.settings.mode {
            toolmux_core::config::Mode::Passthrough => "passthrough",
            toolmux_core::config::Mode::ToolSearch => "tool-search",
        }
    );
    if config.servers.is_empty() {
        println!("no servers configured");
    }
    for (name, entry) in &config.servers {
        let args_preview = if entry.args.is_empty() {
            String::new()
        } else {
            format!(" {}", entry.args.join(" "))
        };
        let cached = cache
            .tools_for_server(name)
            .map(|t| format!("{} tools cached", t.len()))
            .unwrap_or_else(|| "not cached".to_string());
        println!("{name} -> {}{args_preview} ({cached})", entry.command);
    }
    if loaded {
        println!(
            "cache: {} tools, generated {}",
            cache.tool_count(),
            cache.generated_at().to_rfc3339()
        );
    } else {
        println!("cache: absent (run `toolmux generate`)");
    }
    Ok(())
}

fn reset(toolmux_home: &Path, config: &Config) -> Result<()> {
    let cache_dir = config::cache_dir(&config.settings, toolmux_home);
    let mut removed = 0;
    for name in [SCHEMA_CACHE_FILE, "schema-cache.json.tmp"] {
        let path = cache_dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                println!("removed {}", path.display());
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
    if removed == 0 {
        println!("no cache files to remove");
    }
    Ok(())
}

async fn search(toolmux_home: &Path, config: Config, query: &str, limit: usize) -> Result<()> {
    let cache_dir = config::cache_dir(&config.settings, toolmux_home);
    let cache = SchemaCache::new(&cache_dir);
    cache.load().await;

    let mut docs = Vec::new();
    for server in cache.server_names() {
        let Some(tools) = cache.tools_for_server(&server) else {
            continue;
        };
        for tool in tools {
            docs.push(IndexedTool {
                exposed_name: toolmux_core::schema_cache::qualified_tool_name(&server, &tool.name),
                original_name: tool.name.clone(),
                server: server.clone(),
                tool,
            });
        }
    }
    let index = SearchIndex::build(docs);
    if index.is_empty() {
        println!("index is empty; run `toolmux generate` first");
        return Ok(());
    }

    let hits = index.search(query, limit);
    if hits.is_empty() {
        println!("no matches for \"{query}\" across {} tools", index.len());
        return Ok(());
    }
    for hit in hits {
        let description = hit.tool.tool.description.as_deref().unwrap_or("");
        println!(
            "{:>7.3}  {}/{}  {}",
            hit.score, hit.tool.server, hit.tool.original_name, description
        );
    }
    Ok(())
}
