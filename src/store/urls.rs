use std::sync::Arc;

use crate::protocol::AssetKey;

use super::config::SharedConfig;

/// Renders a key into the external URL consumers use to fetch it
pub trait UrlBuilder: Send + Sync {
    fn build_asset_url(&self, key: &AssetKey) -> String;
}

impl<F> UrlBuilder for F
where
    F: Fn(&AssetKey) -> String + Send + Sync,
{
    fn build_asset_url(&self, key: &AssetKey) -> String {
        self(key)
    }
}

/// Builds `[content_host]<virtual_path>/<key>/<asset_file_name>` from the
/// live configuration
pub struct AssetUrlBuilder {
    config: Arc<SharedConfig>,
}

impl AssetUrlBuilder {
    pub fn new(config: Arc<SharedConfig>) -> Self {
        Self { config }
    }
}

impl UrlBuilder for AssetUrlBuilder {
    fn build_asset_url(&self, key: &AssetKey) -> String {
        let config = self.config.snapshot();
        format!(
            "{}{}/{}/{}",
            config.content_host.as_deref().unwrap_or_default(),
            config.virtual_path.trim_end_matches('/'),
            key,
            config.asset_file_name
        )
    }
}
