use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::protocol::StoreError;

/// Configuration for the asset store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// URL path prefix assets are published under (default: `/assets`)
    pub virtual_path: String,

    /// Directory holding one subdirectory per key. Empty means not yet configured.
    pub physical_path: PathBuf,

    /// Optional scheme+host prefix that may precede the virtual path in URLs
    pub content_host: Option<String>,

    /// Glob on file names that the watcher reports (default: `*.css`)
    pub asset_pattern: String,

    /// File name used when building the URL for a key
    pub asset_file_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            virtual_path: "/assets".to_string(),
            physical_path: PathBuf::new(),
            content_host: None,
            asset_pattern: "*.css".to_string(),
            asset_file_name: "bundle.css".to_string(),
        }
    }
}

impl StoreConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let data = std::fs::read_to_string(path).map_err(|e| StoreError::InvalidConfig {
            message: format!("{}: {}", path.display(), e),
        })?;
        let config: StoreConfig =
            serde_json::from_str(&data).map_err(|e| StoreError::InvalidConfig {
                message: format!("{}: {}", path.display(), e),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if !self.virtual_path.is_empty() && !self.virtual_path.starts_with('/') {
            return Err(StoreError::InvalidConfig {
                message: format!("virtual_path must start with '/': {}", self.virtual_path),
            });
        }
        glob::Pattern::new(&self.asset_pattern).map_err(|e| StoreError::InvalidConfig {
            message: format!("asset_pattern '{}': {}", self.asset_pattern, e),
        })?;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        !self.physical_path.as_os_str().is_empty()
    }
}

type PathChangeListener = Box<dyn Fn(&StoreConfig) + Send + Sync>;

/// Runtime view of the configuration, shared by the store and whoever owns the
/// settings. Changing the physical path notifies every registered listener.
pub struct SharedConfig {
    current: RwLock<StoreConfig>,
    listeners: Mutex<Vec<PathChangeListener>>,
}

impl SharedConfig {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            current: RwLock::new(config),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> StoreConfig {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn physical_path(&self) -> PathBuf {
        self.snapshot().physical_path
    }

    /// Register a listener for physical path changes. Listeners run
    /// synchronously on the thread calling [`SharedConfig::set_physical_path`]
    /// and receive the updated configuration.
    pub fn on_physical_path_change<F>(&self, listener: F)
    where
        F: Fn(&StoreConfig) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Update the physical path and notify listeners, even when the value is
    /// unchanged: the signal doubles as a request to re-arm watches.
    pub fn set_physical_path(&self, path: impl Into<PathBuf>) {
        let updated = {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            current.physical_path = path.into();
            current.clone()
        };
        tracing::info!("Physical path set to '{}'", updated.physical_path.display());

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(&updated);
        }
    }

    pub fn set_virtual_path(&self, virtual_path: impl Into<String>) {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .virtual_path = virtual_path.into();
    }

    pub fn set_content_host(&self, content_host: Option<String>) {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .content_host = content_host;
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
