use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::cache::{self, SharedCache};
use crate::config::{self, ProxyConfig};

pub fn spawn(path: PathBuf, config: Arc<ArcSwap<ProxyConfig>>) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, config) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, config: Arc<ArcSwap<ProxyConfig>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => reload(&path, &config, cache::global()),
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Editors often truncate then write, so a failed parse is retried briefly.
fn reload(path: &Path, config: &ArcSwap<ProxyConfig>, cache: &SharedCache) {
    let mut retries = 3;
    loop {
        match config::load_config(path) {
            Ok(new_cfg) => {
                if size_change_ignored(cache, config.load().cache.size, new_cfg.cache.size) {
                    info!(target = "watcher", size = new_cfg.cache.size, "cache already built, size change ignored");
                }
                config.store(Arc::new(new_cfg));
                info!(target = "watcher", path = %path.display(), "config reloaded");
                return;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                    return;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Capacity is fixed once the shared cache exists.
fn size_change_ignored(cache: &SharedCache, old: usize, new: usize) -> bool {
    old != new && cache.get().is_some()
}
