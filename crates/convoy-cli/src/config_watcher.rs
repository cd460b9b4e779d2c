//! Config hot-reload watcher.
//!
//! Watches `convoy.toml` for modifications and invokes a callback with the
//! freshly parsed [`ReloadableConfig`] after a debounce window.

use crate::workers::WorkerConfig;
use convoy_core::{ConvoyError, ConvoyResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

/// The part of the configuration `serve` picks up while running.
///
/// Orchestrator settings are fixed at start-up; only new `[[workers]]`
/// entries take effect on reload.
#[derive(Debug, Clone, Deserialize)]
pub struct ReloadableConfig {
    #[serde(default)]
    pub workers: Option<Vec<WorkerConfig>>,
}

/// Watches a config file on disk and calls back on every (debounced) change.
///
/// Dropping it stops the watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path` for modifications.
    ///
    /// `on_reload` runs on a background thread each time the file changes
    /// and parses cleanly. Parse errors are logged and skipped.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> ConvoyResult<Self>
    where
        F: Fn(ReloadableConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| ConvoyError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| ConvoyError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let mut last_reload = std::time::Instant::now();
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // One reload per burst of writes.
                while rx.try_recv().is_ok() {}

                let since = last_reload.elapsed();
                if since < debounce {
                    std::thread::sleep(debounce - since);
                }
                last_reload = std::time::Instant::now();

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

/// Read and parse a TOML config file into a [`ReloadableConfig`].
pub fn parse_config(path: &Path) -> ConvoyResult<ReloadableConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ConvoyError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        ConvoyError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })
}
