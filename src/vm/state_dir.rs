// Private State Directory
//
// The lock files, the process registry and retargeted VM configs live in one
// directory that fcctl writes as root. It is created 0700, and an existing
// one must be a real directory owned by the effective user that nobody else
// can write to. Files are replaced through a randomly named temp file in the
// same directory (O_EXCL) and a rename, so a planted symlink is never
// followed.

use crate::error::{LifecycleError, Result};
use std::fs::{self, DirBuilder};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::Path;
use tracing::debug;

/// Mode for a state directory fcctl creates
pub const STATE_DIR_MODE: u32 = 0o700;

/// Create `path` if needed and check that it is safe to write into
pub fn ensure(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).is_err() {
        debug!("Creating state directory {:?}", path);
        DirBuilder::new()
            .recursive(true)
            .mode(STATE_DIR_MODE)
            .create(path)?;
    }

    let meta = fs::symlink_metadata(path)?;
    let unsafe_dir = |reason: String| LifecycleError::UnsafeStateDir {
        path: path.to_path_buf(),
        reason,
    };

    if meta.file_type().is_symlink() {
        return Err(unsafe_dir("it is a symlink".to_string()));
    }
    if !meta.is_dir() {
        return Err(unsafe_dir("it is not a directory".to_string()));
    }

    let euid = nix::unistd::geteuid().as_raw();
    if meta.uid() != euid {
        return Err(unsafe_dir(format!(
            "owned by uid {}, expected uid {}",
            meta.uid(),
            euid
        )));
    }

    let mode = meta.mode() & 0o7777;
    if mode & 0o022 != 0 {
        return Err(unsafe_dir(format!(
            "writable by group or others (mode {:04o})",
            mode
        )));
    }
    Ok(())
}

/// Atomically replace `dest` (inside `dir`) with `contents`
///
/// A symlink already sitting at `dest` is replaced, never written through.
pub fn write_private(dir: &Path, dest: &Path, contents: &[u8]) -> Result<()> {
    ensure(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
