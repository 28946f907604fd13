//! File-mtime polling watcher for hot-reloading cache and telemetry switches.
//!
//! Only the runtime-toggleable parts of a reloaded [`Config`] are acted on by
//! the receiver (see [`crate::app::App::apply_reload`]); capacities and paths
//! need a restart.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;

/// Polling-based config watcher.
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    last_mtime: Option<SystemTime>,
    last_config: Option<Config>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
            last_mtime: None,
            last_config: None,
        }
    }

    pub fn default_path(poll_interval: Duration) -> Self {
        Self::new(Config::path(), poll_interval)
    }

    /// Check the file once. Returns a config when the file changed and the
    /// reloaded content differs from the last one forwarded.
    pub fn poll_once(&mut self) -> Option<Config> {
        let current = read_mtime(&self.path);
        let changed = match (self.last_mtime, current) {
            (Some(prev), Some(next)) => next != prev,
            (None, Some(_)) => true,
            _ => false,
        };
        if !changed {
            return None;
        }
        self.last_mtime = current;

        match Config::load_from_path(&self.path) {
            Ok(config) => {
                if self.last_config.as_ref() == Some(&config) {
                    debug!(path = %self.path.display(), "Config touched but unchanged");
                    return None;
                }
                self.last_config = Some(config.clone());
                Some(config)
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Config reload rejected; keeping running configuration"
                );
                None
            }
        }
    }

    pub async fn watch(
        mut self,
        tx: mpsc::UnboundedSender<Config>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.last_mtime = read_mtime(&self.path);
        self.last_config = Config::load_from_path(&self.path).ok();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Config watcher shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if *shutdown_rx.borrow() {
                return;
            }

            if let Some(config) = self.poll_once() {
                debug!(path = %self.path.display(), "Config file changed, reloading");
                if tx.send(config).is_err() {
                    warn!("Config watcher receiver dropped, stopping watcher");
                    return;
                }
            }
        }
    }
}

fn read_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn poll_once_detects_new_file() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.json");
        let mut watcher = ConfigWatcher::new(cfg_path.clone(), Duration::from_millis(25));
        assert!(watcher.poll_once().is_none(), "missing file is not a change");

        std::fs::write(&cfg_path, r#"{"agent":{"max_steps":3}}"#).unwrap();
        let loaded = watcher.poll_once().expect("new file should load");
        assert_eq!(loaded.agent.max_steps, 3);
        assert!(watcher.poll_once().is_none(), "same mtime is not a change");
    }

    #[test]
    fn poll_once_keeps_running_config_on_bad_file() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.json");
        std::fs::write(&cfg_path, "{ broken").unwrap();
        let mut watcher = ConfigWatcher::new(cfg_path, Duration::from_millis(25));
        assert!(watcher.poll_once().is_none());
    }

    #[tokio::test]
    async fn watcher_emits_on_change() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.json");
        std::fs::write(&cfg_path, "{}").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = ConfigWatcher::new(cfg_path.clone(), Duration::from_millis(25));
        let handle = tokio::spawn(watcher.watch(tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&cfg_path, r#"{"agent":{"max_turns":4}}"#).unwrap();

        let loaded = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.agent.max_turns, 4);

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }
}
