use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::protocol::StoreError;

/// Mode of stored assets; temp files start out owner-only
#[cfg(unix)]
const ASSET_FILE_MODE: u32 = 0o644;

/// Readable content of a stored asset
pub type ContentStream = Box<dyn Read + Send>;

/// Low-level file primitives the store is built on
pub trait ContentIo: Send + Sync {
    fn save(&self, content: &[u8], path: &Path) -> Result<(), StoreError>;

    fn open_stream(&self, path: &Path) -> Result<ContentStream, StoreError>;

    fn directory_exists(&self, path: &Path) -> bool;

    /// Create `path` and any missing ancestors. Succeeds if it already exists.
    fn create_directory(&self, path: &Path) -> Result<(), StoreError>;

    /// Immediate subdirectories of `path`
    fn list_directories(&self, path: &Path) -> Result<Vec<PathBuf>, StoreError>;
}

/// [`ContentIo`] over the local disk
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskIo;

impl ContentIo for DiskIo {
    /// Writes to a temp file beside the target and renames it into place, so
    /// readers see either the old content or the new, never a partial file.
    fn save(&self, content: &[u8], path: &Path) -> Result<(), StoreError> {
        let dir = path.parent().ok_or_else(|| {
            StoreError::storage(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"),
            )
        })?;

        let mut file = NamedTempFile::new_in(dir).map_err(|e| StoreError::storage(path, e))?;
        file.write_all(content)
            .map_err(|e| StoreError::storage(path, e))?;
        file.as_file()
            .sync_all()
            .map_err(|e| StoreError::storage(path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(fs::Permissions::from_mode(ASSET_FILE_MODE))
                .map_err(|e| StoreError::storage(path, e))?;
        }
        file.persist(path)
            .map_err(|e| StoreError::storage(path, e.error))?;
        Ok(())
    }

    fn open_stream(&self, path: &Path) -> Result<ContentStream, StoreError> {
        let file = fs::File::open(path).map_err(|e| StoreError::read(path, e))?;
        if !file
            .metadata()
            .map_err(|e| StoreError::read(path, e))?
            .is_file()
        {
            return Err(StoreError::NotFound {
                path: path.display().to_string(),
            });
        }
        Ok(Box::new(BufReader::new(file)))
    }

    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_directory(&self, path: &Path) -> Result<(), StoreError> {
        match fs::create_dir_all(path) {
            Ok(()) => Ok(()),
            // Another writer got there first
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
            Err(e) => Err(StoreError::storage(path, e)),
        }
    }

    fn list_directories(&self, path: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("Physical path {} does not exist yet", path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(StoreError::storage(path, e)),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::storage(path, e))?;
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => dirs.push(entry.path()),
                Ok(_) => {}
                // Removed between listing and inspection
                Err(_) => continue,
            }
        }
        Ok(dirs)
    }
}
