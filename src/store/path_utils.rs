use std::path::{Path, PathBuf};

use crate::protocol::StoreError;

use super::operations::ContentIo;

/// Translate an external asset URL into the physical file it names.
///
/// `[content_host]<virtual_path>/<key>/<file>` maps to
/// `<physical_root>/<key>/<file>`. The content host is only stripped when the
/// URL starts with it. Query strings and fragments are ignored.
pub fn resolve_physical_path(
    url: &str,
    virtual_path: &str,
    physical_root: &Path,
    content_host: Option<&str>,
) -> Result<PathBuf, StoreError> {
    if physical_root.as_os_str().is_empty() {
        return Err(StoreError::invalid_url(url, "physical path is not configured"));
    }

    let mut relative = url;
    if let Some(host) = content_host.filter(|h| !h.is_empty()) {
        relative = relative.strip_prefix(host).unwrap_or(relative);
    }
    let relative = relative
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default();

    let virtual_path = virtual_path.trim_end_matches('/');
    let rest = relative.strip_prefix(virtual_path).ok_or_else(|| {
        StoreError::invalid_url(url, format!("not under virtual path '{}'", virtual_path))
    })?;
    // "/assetsfoo/..." must not match "/assets"
    if !rest.starts_with('/') {
        return Err(StoreError::invalid_url(
            url,
            format!("not under virtual path '{}'", virtual_path),
        ));
    }

    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(StoreError::invalid_url(
            url,
            "expected <key>/<file> after the virtual path",
        ));
    }
    if let Some(bad) = segments.iter().find(|s| is_unsafe_segment(s)) {
        return Err(StoreError::invalid_url(
            url,
            format!("segment '{}' is not allowed", bad),
        ));
    }

    let mut path = physical_root.to_path_buf();
    path.extend(segments);
    Ok(path)
}

fn is_unsafe_segment(segment: &str) -> bool {
    segment == "." || segment == ".." || segment.contains('\\')
}

/// Create the directory that will hold `path` unless it already exists.
///
/// Concurrent creators do not fail each other; a file sitting where a
/// directory is needed is reported as a storage failure.
pub fn ensure_parent_directory(io: &dyn ContentIo, path: &Path) -> Result<(), StoreError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if io.directory_exists(parent) {
        return Ok(());
    }

    tracing::debug!("Creating key directory {}", parent.display());
    io.create_directory(parent)
}
