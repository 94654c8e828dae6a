//! Filesystem-backed asset store
//!
//! Assets live at `<physical_path>/<key>/<file>` and are addressed by
//! `[content_host]<virtual_path>/<key>/<file>` URLs. The store keeps a watch on
//! the physical path so subscribers hear about keys added or deleted by any
//! process, and re-arms that watch whenever the physical path is reconfigured.

pub mod config;
pub mod entries;
pub mod operations;
pub mod path_utils;
pub mod urls;
pub mod watcher;


use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{AssetChanged, AssetKey, StoreError, StoredEntries};

use config::SharedConfig;
use operations::{ContentIo, ContentStream, DiskIo};
use urls::{AssetUrlBuilder, UrlBuilder};
use watcher::AssetWatcher;

pub struct LocalDiskStore {
    config: Arc<SharedConfig>,
    io: Arc<dyn ContentIo>,
    urls: Arc<dyn UrlBuilder>,
    watcher: Arc<AssetWatcher>,
}

impl LocalDiskStore {
    /// Store on the local disk, building URLs from the shared configuration
    pub fn new(config: Arc<SharedConfig>) -> Self {
        let urls = Arc::new(AssetUrlBuilder::new(config.clone()));
        Self::with_collaborators(config, Arc::new(DiskIo), urls)
    }

    /// Store over caller-supplied file primitives and URL builder.
    ///
    /// Starts watching the configured physical path right away (if any) and
    /// again every time the configuration reports a new physical path.
    pub fn with_collaborators(
        config: Arc<SharedConfig>,
        io: Arc<dyn ContentIo>,
        urls: Arc<dyn UrlBuilder>,
    ) -> Self {
        let watcher = Arc::new(AssetWatcher::new(urls.clone()));

        let listener = Arc::downgrade(&watcher);
        config.on_physical_path_change(move |updated| {
            if let Some(watcher) = listener.upgrade() {
                watcher.rearm(&updated.physical_path, &updated.asset_pattern);
            }
        });

        let current = config.snapshot();
        watcher.rearm(&current.physical_path, &current.asset_pattern);

        Self {
            config,
            io,
            urls,
            watcher,
        }
    }

    pub fn config(&self) -> &SharedConfig {
        self.config.as_ref()
    }

    pub fn watcher(&self) -> &AssetWatcher {
        self.watcher.as_ref()
    }

    /// Persist `content` under `url`, creating the key directory if needed
    pub fn save(&self, content: &[u8], url: &str) -> Result<(), StoreError> {
        let path = self.resolve(url)?;
        path_utils::ensure_parent_directory(self.io.as_ref(), &path)?;
        self.io.save(content, &path)?;
        tracing::debug!("Saved {} bytes to {}", content.len(), path.display());
        Ok(())
    }

    /// Open the content stored under `url`.
    ///
    /// Unlike [`LocalDiskStore::save`] this never creates directories; a
    /// missing file is `NotFound`.
    pub fn open_read_stream(&self, url: &str) -> Result<ContentStream, StoreError> {
        let path = self.resolve(url)?;
        tracing::debug!("Opening {}", path.display());
        self.io.open_stream(&path)
    }

    /// Reserved for a direct-bytes accessor; use [`LocalDiskStore::open_read_stream`]
    pub fn get_content(&self, _url: &str) -> Result<Vec<u8>, StoreError> {
        Err(StoreError::Unsupported {
            operation: "get_content",
        })
    }

    /// Keys currently on disk and their URLs, recomputed on every call
    pub fn list_stored_entries(&self) -> Result<StoredEntries, StoreError> {
        entries::list_stored_entries(
            self.io.as_ref(),
            self.urls.as_ref(),
            &self.config.physical_path(),
        )
    }

    /// Install the add callback, replacing any previous one.
    ///
    /// Runs on the file system notification thread, possibly before the
    /// writer has finished flushing the file.
    pub fn register_add_callback<F>(&self, callback: F)
    where
        F: Fn(AssetKey, &str) + Send + Sync + 'static,
    {
        self.watcher.set_add_callback(Arc::new(callback));
    }

    /// Install the delete callback, replacing any previous one
    pub fn register_delete_callback<F>(&self, callback: F)
    where
        F: Fn(AssetKey) + Send + Sync + 'static,
    {
        self.watcher.set_delete_callback(Arc::new(callback));
    }

    /// Feed of every add/delete notification
    pub fn subscribe(&self) -> broadcast::Receiver<AssetChanged> {
        self.watcher.subscribe()
    }

    /// Re-arm the watcher against the current physical path, e.g. after the
    /// directory was created
    pub fn rewatch(&self) {
        let current = self.config.snapshot();
        self.watcher
            .rearm(&current.physical_path, &current.asset_pattern);
    }

    pub fn url_for(&self, key: &AssetKey) -> String {
        self.urls.build_asset_url(key)
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, StoreError> {
        let config = self.config.snapshot();
        path_utils::resolve_physical_path(
            url,
            &config.virtual_path,
            &config.physical_path,
            config.content_host.as_deref(),
        )
    }
}

impl Drop for LocalDiskStore {
    fn drop(&mut self) {
        self.watcher.stop();
    }
}
