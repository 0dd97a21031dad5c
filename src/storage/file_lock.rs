use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use crate::core::error::{Error, Result};

/// Single writer guarantee for one content directory.
///
/// Holds an exclusive `flock` on `<dir>/.lock` until dropped; a second process
/// opening the same tree fails instead of interleaving partition rewrites.
pub struct FileLock {
    pub file: File,
    pub path: PathBuf,
}

impl FileLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::storage(format!("Opening {}", path.display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_EX, LOCK_NB};

            let fd = file.as_raw_fd();
            let locked = unsafe { flock(fd, LOCK_EX | LOCK_NB) == 0 };
            if !locked {
                return Err(Error::storage(
                    format!("{} is held by another process", path.display()),
                    std::io::Error::last_os_error(),
                ));
            }
        }

        Ok(FileLock { file, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_UN};

            let fd = self.file.as_raw_fd();
            unsafe {
                flock(fd, LOCK_UN);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = TempDir::new().unwrap();
        let first = FileLock::acquire(dir.path()).unwrap();

        // flock locks belong to the open file description, so a fresh open conflicts.
        let err = FileLock::acquire(dir.path()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Storage);

        drop(first);
        assert!(FileLock::acquire(dir.path()).is_ok());
    }
}
