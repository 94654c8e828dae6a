//! Types shared between the store and its subscribers
//!
//! Keys, change notifications and the error taxonomy of the store. Everything
//! that crosses the watcher boundary is serializable so the CLI can emit it as
//! JSON lines.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Length of the hyphenated key form, e.g. `3fa85f64-5717-4562-b3fc-2c963f66afa6`
const KEY_LENGTH: usize = 36;

/// Identifies one stored asset. Rendered as a lowercase hyphenated UUID, which
/// is also the name of the asset's directory under the physical root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(Uuid);

impl AssetKey {
    /// Generate a fresh random key
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse a directory name as a key.
    ///
    /// Only the exact rendered form is accepted: lowercase and hyphenated. A
    /// name that parses therefore renders back to itself, so the key's URL
    /// resolves to the directory it was read from. Uppercase, braced, URN and
    /// simple forms are treated as foreign directories.
    pub fn parse(name: &str) -> Option<Self> {
        if name.len() != KEY_LENGTH {
            return None;
        }
        let key = Self(Uuid::try_parse(name).ok()?);
        if key.to_string() != name {
            return None;
        }
        Some(key)
    }

    /// Key named by the final segment of a directory path
    pub fn from_directory(dir: &Path) -> Option<Self> {
        dir.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::parse)
    }

    /// Key owning a file, i.e. the key named by the file's parent directory
    pub fn from_file_path(path: &Path) -> Option<Self> {
        path.parent().and_then(Self::from_directory)
    }
}

impl Default for AssetKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for AssetKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| StoreError::InvalidArgument {
            url: s.to_string(),
            reason: "not a hyphenated asset key".to_string(),
        })
    }
}

/// Key to external URL, as observed by enumerating the physical root
pub type StoredEntries = HashMap<AssetKey, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Deleted,
}

/// A dispatched add/delete notification, as published on the broadcast feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetChanged {
    pub key: AssetKey,
    pub kind: ChangeKind,
    /// URL built for the key; only set for additions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// File that triggered the event
    pub path: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// URL cannot be mapped to a physical path
    #[error("invalid url '{url}': {reason}")]
    InvalidArgument { url: String, reason: String },

    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("storage failure at {path}: {source}")]
    StorageFailure {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The OS-level watch could not be established. Never returned from the
    /// store's public operations; logged and swallowed by the watcher.
    #[error("cannot watch {path}: {message}")]
    WatchUnavailable { path: String, message: String },

    #[error("{operation} is not supported; use open_read_stream")]
    Unsupported { operation: &'static str },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl StoreError {
    /// Failure of a write or directory operation
    pub fn storage(path: &Path, source: io::Error) -> Self {
        StoreError::StorageFailure {
            path: path.display().to_string(),
            source,
        }
    }

    /// Failure of a read; a missing file is reported as `NotFound`
    pub fn read(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound {
                path: path.display().to_string(),
            }
        } else {
            Self::storage(path, source)
        }
    }

    pub(crate) fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}
