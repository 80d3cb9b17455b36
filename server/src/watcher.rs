//! Hot-reload watcher: polls the config and schema-cache files for mtime
//! changes so dashboard edits (possibly from another process) reach the
//! running proxy without a restart.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use tokio::task::JoinHandle;
use tracing::info;

use toolmux_core::ProxyHandler;
use toolmux_core::config;
use toolmux_core::schema_cache::log_load_outcome;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

pub fn spawn_watcher(handler: Arc<ProxyHandler>, toolmux_home: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config_path = config::config_path(&toolmux_home);
        let cache_path = handler.cache().cache_path().to_path_buf();
        let mut last_config = mtime(&config_path);
        let mut last_cache = mtime(&cache_path);

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let current = mtime(&config_path);
            if current != last_config {
                last_config = current;
                info!("config file changed; reloading");
                let config = config::load_or_init(&toolmux_home);
                handler.reload_config(config).await;
            }

            let current = mtime(&cache_path);
            if current != last_cache {
                last_cache = current;
                let outcome = handler.cache().load().await;
                log_load_outcome(&outcome, &cache_path);
                handler.rebuild_search_index();
            }
        }
    })
}
