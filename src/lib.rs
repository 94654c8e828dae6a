//! Keyed, filesystem-backed content store for generated assets
//!
//! Content is saved under `<physical_path>/<key>/<file>` and read back by its
//! external URL. A file system watch on the physical path reports keys that
//! appear or disappear, whichever process made the change.

pub mod protocol;
pub mod store;

pub use protocol::{AssetChanged, AssetKey, ChangeKind, StoreError, StoredEntries};
pub use store::config::{SharedConfig, StoreConfig};
pub use store::LocalDiskStore;
