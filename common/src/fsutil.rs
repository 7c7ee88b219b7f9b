//! Small filesystem helpers used by the engine.
//!
//! These exist because several engine components share the same durability
//! idioms: publish-by-rename for state files and world-readable working
//! directories that several worker processes traverse.
//!

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use eyre::Result;
use tracing::trace;

/// Write `data` to a sibling temporary file then atomically rename it over
/// `path`. Readers either see the old content or the new one, never a
/// partial write.
///
#[tracing::instrument(skip(data))]
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    trace!("atomic_write({})", path.display());

    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Create a directory traversable by every process on the node.
///
#[tracing::instrument]
pub fn make_public_dir(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
    Ok(path.to_path_buf())
}

/// Whether two paths live on the same device. Both must exist.
///
#[tracing::instrument]
pub fn same_device(a: &Path, b: &Path) -> Result<bool> {
    let da = fs::metadata(a)?.dev();
    let db = fs::metadata(b)?.dev();
    Ok(da == db)
}

/// Mark a file read-only for everyone (mode 0444).
///
pub fn make_read_only(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o444))?;
    Ok(())
}

/// Undo `make_read_only` for a private copy handed to a caller that asked
/// for a mutable file.
///
pub fn make_writable(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// Hard-link count of a file.
///
pub fn nlink(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.nlink())
}
