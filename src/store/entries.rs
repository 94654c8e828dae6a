use std::path::Path;

use crate::protocol::{AssetKey, StoreError, StoredEntries};

use super::operations::ContentIo;
use super::urls::UrlBuilder;

/// Map every key directory under `physical_root` to its external URL.
///
/// Subdirectories whose names are not keys are skipped. An unset root yields
/// an empty map, since the store may run before it is configured.
pub fn list_stored_entries(
    io: &dyn ContentIo,
    urls: &dyn UrlBuilder,
    physical_root: &Path,
) -> Result<StoredEntries, StoreError> {
    let mut entries = StoredEntries::new();
    if physical_root.as_os_str().is_empty() {
        return Ok(entries);
    }

    for dir in io.list_directories(physical_root)? {
        match AssetKey::from_directory(&dir) {
            Some(key) => {
                entries.insert(key, urls.build_asset_url(&key));
            }
            None => tracing::trace!("Skipping non-key directory {}", dir.display()),
        }
    }
    Ok(entries)
}
