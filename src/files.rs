//! Owner-only, atomically replaced state files
//!
//! The frpc config, the PID file and the credentials file are all written
//! through [`write_private`]: the content goes to a temporary file in the same
//! directory which is then renamed over the target, so readers only ever see
//! the old or the new version.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

/// Atomically replace `path` with `contents`, readable by the owner only
pub fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
                warn!(path = %dir.display(), error = %e, "Could not restrict directory permissions");
            }
        }
    }

    // NamedTempFile is created 0600 on unix
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// [`write_private`] on the blocking pool, for callers on the async runtime
pub async fn write_private_async(path: PathBuf, contents: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || write_private(&path, &contents))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Read a PID file.
///
/// Returns `Ok(None)` when the file does not exist or is empty, and an
/// `InvalidData` error when it holds something other than a process id.
pub fn read_pid(path: &Path) -> io::Result<Option<u32>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    match trimmed.parse::<u32>() {
        Ok(pid) if pid > 1 => Ok(Some(pid)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid PID file content: {:?}", trimmed),
        )),
    }
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_private_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frpc.ini");

        write_private(&path, b"first").unwrap();
        write_private(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // No temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("frpc.pid");

        write_private(&path, b"1234\n").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_write_private_async() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frp").join("frpc.ini");

        write_private_async(path.clone(), b"[common]\n".to_vec())
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[common]\n");
    }

    #[test]
    fn test_read_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frpc.pid");

        assert_eq!(read_pid(&path).unwrap(), None);

        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(4242));

        std::fs::write(&path, "").unwrap();
        assert_eq!(read_pid(&path).unwrap(), None);

        std::fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(
            read_pid(&path).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );

        // pid 0 and 1 would signal our own group or init
        std::fs::write(&path, "1").unwrap();
        assert!(read_pid(&path).is_err());
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frpc.pid");

        assert!(!remove_if_exists(&path).unwrap());
        std::fs::write(&path, "1").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }
}
