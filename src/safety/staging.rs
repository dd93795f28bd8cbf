/// Run-scoped staging of submitted binaries
/// One private directory per attempt, holding exactly one executable
use crate::config::types::{BinTraceError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A staged copy of a binary. Dropping it without `release` still removes
/// the directory, but errors are only logged.
#[derive(Debug)]
pub struct StagedBinary {
    dir: Option<TempDir>,
    binary_path: PathBuf,
}

/// Copy `content` into a fresh owner-only directory as `<label>-binary`.
///
/// The directory is created atomically with mode 0700 and the file with
/// 0700. The write descriptor is closed before returning so the file can
/// be executed immediately.
pub fn stage_binary(content: &[u8], label: &str) -> Result<StagedBinary> {
    let dir = tempfile::Builder::new()
        .prefix(&format!("{}-", label))
        .permissions(fs::Permissions::from_mode(0o700))
        .tempdir()
        .map_err(|e| BinTraceError::Launch(format!("Failed to create staging directory: {}", e)))?;
    // The creation mode is filtered through the umask; pin the final mode.
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).map_err(|e| {
        BinTraceError::Launch(format!(
            "Failed to restrict staging directory {}: {}",
            dir.path().display(),
            e
        ))
    })?;

    let binary_path = dir.path().join(format!("{}-binary", label));
    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o700)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOFOLLOW)
            .open(&binary_path)?;
        file.write_all(content)?;
        file.sync_all()
    };
    write().map_err(|e| {
        BinTraceError::Launch(format!(
            "Failed to stage binary {}: {}",
            binary_path.display(),
            e
        ))
    })?;

    log::debug!(
        "Staged {} bytes at {}",
        content.len(),
        binary_path.display()
    );

    Ok(StagedBinary {
        dir: Some(dir),
        binary_path,
    })
}

impl StagedBinary {
    pub fn path(&self) -> &Path {
        &self.binary_path
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    /// Recursively delete the staging directory.
    pub fn release(mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => {
                let path = dir.path().to_path_buf();
                dir.close().map_err(|e| {
                    BinTraceError::Io(std::io::Error::new(
                        e.kind(),
                        format!("Failed to remove staging directory {}: {}", path.display(), e),
                    ))
                })
            }
            None => Ok(()),
        }
    }
}

impl Drop for StagedBinary {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                log::warn!("Failed to remove staging directory {}: {}", path.display(), e);
                let _ = fs::remove_dir_all(&path);
            }
        }
    }
}
