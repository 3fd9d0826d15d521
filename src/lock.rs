use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::LockError;

pub const LOCK_FILE: &str = ".gantry.lock";

/// Keeps two invocations from mutating the same build directory at once.
/// The lock file is removed when this value is dropped.
#[derive(Debug)]
pub struct InvocationLock {
    path: Utf8PathBuf,
}

impl InvocationLock {
    pub fn acquire(build_dir: &Utf8Path) -> Result<Self, LockError> {
        let path = build_dir.join(LOCK_FILE);
        let io = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(build_dir).map_err(io)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(LockError::Held(path.clone()));
            }
            Err(err) => return Err(io(err)),
        };

        writeln!(file, "{}", std::process::id()).map_err(io)?;
        tracing::debug!("acquired {path}");

        Ok(Self { path })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for InvocationLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!("couldn't release {}: {err}", self.path);
        }
    }
}
