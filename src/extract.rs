//! Filesystem side of extraction: destination vetting and object creation.
//!
//! Extraction never overwrites. The destination must not exist, and no
//! existing ancestor of the destination may be a symlink, so a hostile
//! working tree cannot redirect writes outside the intended directory.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{ArchiveError, Result};

/// Vet `dst` and, when asked, create its missing parent directories.
pub(crate) fn prepare(dst: &Path, create_parents: bool) -> Result<()> {
    if fs::symlink_metadata(dst).is_ok() {
        return Err(ArchiveError::DestinationExists {
            path: dst.to_path_buf(),
        });
    }

    for ancestor in dst.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        if let Ok(meta) = fs::symlink_metadata(ancestor) {
            if meta.file_type().is_symlink() {
                return Err(ArchiveError::extraction(format!(
                    "refusing to traverse symlink {ancestor:?} on the way to the destination"
                )));
            }
        }
    }

    if create_parents {
        if let Some(parent) = dst.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ArchiveError::extraction_io(&e))?;
            }
        }
    }
    Ok(())
}

/// Open the destination for a regular entry. `create_new` so a file racing
/// into existence after [`prepare`] still cannot be overwritten.
pub(crate) fn create_file(dst: &Path) -> Result<File> {
    File::options()
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => ArchiveError::DestinationExists {
                path: dst.to_path_buf(),
            },
            _ => ArchiveError::extraction_io(&e),
        })
}

pub(crate) fn create_dir(dst: &Path) -> Result<()> {
    fs::create_dir(dst).map_err(|e| ArchiveError::extraction_io(&e))
}

#[cfg(unix)]
pub(crate) fn create_symlink(target: &[u8], dst: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let target = Path::new(std::ffi::OsStr::from_bytes(target));
    std::os::unix::fs::symlink(target, dst).map_err(|e| ArchiveError::extraction_io(&e))
}

#[cfg(not(unix))]
pub(crate) fn create_symlink(_target: &[u8], _dst: &Path) -> Result<()> {
    Err(ArchiveError::extraction(
        "symlink extraction is not supported on this platform",
    ))
}

/// Hard link targets name another archive member; they are resolved
/// relative to the destination's parent directory and must stay inside it.
pub(crate) fn create_hardlink(target: &[u8], dst: &Path) -> Result<()> {
    let target = bytes_to_path(target)?;
    if target.is_absolute() {
        return Err(ArchiveError::extraction(format!(
            "refusing absolute hard link target {target:?}"
        )));
    }
    if target
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(ArchiveError::extraction(format!(
            "refusing hard link target {target:?} that escapes the destination"
        )));
    }
    let resolved = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(&target),
        _ => target.clone(),
    };
    fs::hard_link(&resolved, dst).map_err(|e| ArchiveError::extraction_io(&e))
}

/// Best-effort removal of a partially written destination file.
pub(crate) fn discard_partial(dst: &Path) {
    if let Err(e) = fs::remove_file(dst) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove partial file {dst:?}: {e}");
        }
    }
}

fn bytes_to_path(bytes: &[u8]) -> Result<PathBuf> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Ok(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
    }
    #[cfg(not(unix))]
    {
        std::str::from_utf8(bytes)
            .map(PathBuf::from)
            .map_err(|_| ArchiveError::extraction("link target is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_rejects_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("exists");
        fs::write(&dst, b"old").unwrap();
        match prepare(&dst, false) {
            Err(ArchiveError::DestinationExists { path }) => assert_eq!(path, dst),
            other => panic!("expected DestinationExists, got {other:?}"),
        }
        // The existing file is untouched.
        assert_eq!(fs::read(&dst).unwrap(), b"old");
    }

    #[cfg(unix)]
    #[test]
    fn prepare_rejects_symlinked_parent() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let dst = link.join("out.txt");
        let err = prepare(&dst, false).unwrap_err();
        match err {
            ArchiveError::ExtractionIOError { message, .. } => {
                assert!(message.contains("symlink"), "{message}");
            }
            other => panic!("expected ExtractionIOError, got {other:?}"),
        }
    }

    #[test]
    fn prepare_creates_parents_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("a/b/c/out.txt");
        prepare(&dst, true).unwrap();
        assert!(dst.parent().unwrap().is_dir());
        // Without the flag the missing parent surfaces when the file opens.
        let dst2 = dir.path().join("x/y/out.txt");
        prepare(&dst2, false).unwrap();
        assert!(create_file(&dst2).is_err());
    }

    #[test]
    fn hardlink_rejects_escaping_targets() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("link");
        assert!(create_hardlink(b"/etc/passwd", &dst).is_err());
        assert!(create_hardlink(b"../outside", &dst).is_err());
    }

    #[test]
    fn hardlink_resolves_against_parent() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original.txt");
        fs::write(&original, b"shared").unwrap();
        let dst = dir.path().join("copy.txt");
        create_hardlink(b"original.txt", &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"shared");
    }
}
