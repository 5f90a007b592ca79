//! Key file locations and careful writes.
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

/// Where the private key of `peer` lives inside `dir`.
pub fn secret_key_path(dir: &Path, peer: &str) -> PathBuf {
    dir.join(format!("{peer}_dkg-sec.asc"))
}

/// Where the public key of `peer` lives inside `dir`.
pub fn public_key_path(dir: &Path, peer: &str) -> PathBuf {
    dir.join(format!("{peer}_dkg-pub.asc"))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Make sure only the owner can read a secret key file.
///
/// Group or other permission bits are reported and removed.
#[cfg(unix)]
pub fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        warn!(
            "weak permissions {:o} on {}, restricting to 0600",
            mode & 0o777,
            path.display()
        );
        set_mode(path, 0o600)?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn restrict_permissions(path: &Path) -> io::Result<()> {
    fs::metadata(path).map(|_| ())
}

fn stage(path: &Path, contents: &[u8], mode: u32) -> io::Result<tempfile::NamedTempFile> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    set_mode(file.path(), mode)?;
    Ok(file)
}

/// Replace several files, each with the given contents and mode.
///
/// Every file is first written completely to a temporary file next to its
/// target. Only once all of them are written are they renamed over their
/// targets, so a failed write leaves every target untouched.
pub fn write_atomic_all(outputs: &[(&Path, &[u8], u32)]) -> io::Result<()> {
    let staged = outputs
        .iter()
        .map(|(path, contents, mode)| Ok((stage(path, contents, *mode)?, *path)))
        .collect::<io::Result<Vec<_>>>()?;
    for (file, path) in staged {
        file.persist(path).map_err(|e| e.error)?;
    }
    Ok(())
}

/// Replace `path` with `contents` in one step.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    write_atomic_all(&[(path, contents, mode)])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_paths() {
        let dir = Path::new("/keys");
        assert_eq!(
            secret_key_path(dir, "alice"),
            PathBuf::from("/keys/alice_dkg-sec.asc")
        );
        assert_eq!(
            public_key_path(dir, "alice"),
            PathBuf::from("/keys/alice_dkg-pub.asc")
        );
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.asc");
        write_atomic(&path, b"first", 0o644).unwrap();
        write_atomic(&path, b"second", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_failed_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.asc");
        let bad = dir.path().join("missing").join("bad.asc");
        assert!(write_atomic_all(&[
            (good.as_path(), &b"x"[..], 0o600),
            (bad.as_path(), &b"y"[..], 0o600),
        ]).is_err());
        assert!(!good.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_restrict_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.asc");
        write_atomic(&path, b"secret", 0o644).unwrap();
        restrict_permissions(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(restrict_permissions(&dir.path().join("missing")).is_err());
    }
}
