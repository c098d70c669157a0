//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::catalog::{rows_from_config, SharedCatalog};
use crate::config::loader::load_config;
use crate::lifecycle::control::LoopControl;

/// A watcher that monitors the configuration file for changes.
///
/// A valid new file replaces the catalog rows and requests a reload, which is
/// the same path a reload signal takes.
pub struct ConfigWatcher {
    path: PathBuf,
    catalog: Arc<SharedCatalog>,
    control: Arc<LoopControl>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    pub fn new(path: &Path, catalog: Arc<SharedCatalog>, control: Arc<LoopControl>) -> Self {
        Self {
            path: path.to_path_buf(),
            catalog,
            control,
        }
    }

    /// Start watching the file in a background thread.
    ///
    /// The returned watcher must be kept alive for as long as changes matter.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let catalog = self.catalog;
        let control = self.control;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        apply_change(&path, &catalog, &control);
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

fn apply_change(path: &Path, catalog: &SharedCatalog, control: &LoopControl) {
    tracing::info!("Config file change detected, reloading...");
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to reload config. Keeping current configuration.");
            return;
        }
    };

    match catalog.replace(rows_from_config(&config)) {
        Ok(()) => control.request_reload(),
        Err(e) => tracing::warn!(error = %e, "Failed to update listener catalog"),
    }
}
