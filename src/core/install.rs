//! Artifact placement: archives, moves and the permission/ownership fix-up

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::platform::{self, Owner};

/// Run filesystem work off the async runtime
pub async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Process(format!("blocking task failed: {}", e)))?
}

/// Make an installed binary executable and owned by `owner`
pub fn finalize_artifact(path: &Path, owner: Owner) -> Result<()> {
    platform::set_executable(path)
        .map_err(|e| Error::fs(format!("failed to chmod {}", path.display()), e))?;
    platform::set_owner(path, owner)
        .map_err(|e| Error::fs(format!("failed to chown {}", path.display()), e))?;
    debug!("Finalized {:?}", path);
    Ok(())
}

/// Decompress a gzip archive over `target`, then delete the archive
pub fn install_gzip(archive: &Path, target: &Path, owner: Owner) -> Result<()> {
    let staged = sibling(target, ".new");
    let unpack = || -> std::io::Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
        let mut out = File::create(&staged)?;
        std::io::copy(&mut decoder, &mut out)?;
        out.sync_all()?;
        std::fs::rename(&staged, target)
    };
    if let Err(e) = unpack() {
        let _ = std::fs::remove_file(&staged);
        return Err(Error::fs(
            format!("failed to unpack {}", archive.display()),
            e,
        ));
    }

    finalize_artifact(target, owner)?;
    if let Err(e) = std::fs::remove_file(archive) {
        warn!("Failed to remove {:?}: {}", archive, e);
    }
    Ok(())
}

/// Extract a zip archive into `dest`
pub fn unzip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)
        .map_err(|e| Error::fs(format!("failed to open {}", archive.display()), e))?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| {
        Error::fs(
            format!("failed to read {}", archive.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    zip.extract(dest).map_err(|e| {
        Error::fs(
            format!("failed to extract {}", archive.display()),
            std::io::Error::new(std::io::ErrorKind::Other, e),
        )
    })?;
    debug!("Extracted {:?} into {:?}", archive, dest);
    Ok(())
}

/// Move a file, copying when source and target are on different filesystems
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::fs(format!("failed to create {}", parent.display()), e))?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)
        .map_err(|e| Error::fs(format!("failed to copy {} to {}", from.display(), to.display()), e))?;
    std::fs::remove_file(from)
        .map_err(|e| Error::fs(format!("failed to remove {}", from.display()), e))?;
    Ok(())
}

/// Recursively copy `src` into `dst`, overwriting existing files
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Regular files directly inside `dir`
pub fn files_in(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// The directory an archive was really packed from.
///
/// Prefers a top-level directory called `preferred`, then a lone top-level
/// directory, then the extraction root itself.
pub fn extracted_root(extracted: &Path, preferred: &str) -> std::io::Result<PathBuf> {
    let named = extracted.join(preferred);
    if named.is_dir() {
        return Ok(named);
    }
    let entries: Vec<PathBuf> = std::fs::read_dir(extracted)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Ok(extracted.to_path_buf()),
    }
}

/// `path` with `suffix` appended to its file name, hidden
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}{}", name, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_install_gzip_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("core.gz");
        let target = dir.path().join("bin").join("core");

        let mut encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
        encoder.write_all(b"#!/bin/sh\necho new\n").unwrap();
        encoder.finish().unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"old").unwrap();

        install_gzip(&archive, &target, Owner::current()).unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"#!/bin/sh\necho new\n");
        assert!(!archive.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_install_gzip_bad_archive_keeps_target() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("core.gz");
        let target = dir.path().join("core");
        std::fs::write(&archive, b"not gzip").unwrap();
        std::fs::write(&target, b"old").unwrap();

        assert!(install_gzip(&archive, &target, Owner::current()).is_err());
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
        assert!(!sibling(&target, ".new").exists());
    }

    #[test]
    fn test_extracted_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("DeckyClash-1.0")).unwrap();
        assert_eq!(
            extracted_root(dir.path(), "DeckyClash").unwrap(),
            dir.path().join("DeckyClash-1.0")
        );

        std::fs::create_dir_all(dir.path().join("DeckyClash")).unwrap();
        assert_eq!(
            extracted_root(dir.path(), "DeckyClash").unwrap(),
            dir.path().join("DeckyClash")
        );

        let flat = tempfile::tempdir().unwrap();
        std::fs::write(flat.path().join("main.py"), b"").unwrap();
        std::fs::write(flat.path().join("plugin.json"), b"").unwrap();
        assert_eq!(
            extracted_root(flat.path(), "DeckyClash").unwrap(),
            flat.path()
        );
    }

    #[test]
    fn test_copy_tree_overwrites() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("core"), b"mine").unwrap();
        std::fs::write(src.path().join("nested").join("x"), b"x").unwrap();
        std::fs::write(dst.path().join("core"), b"theirs").unwrap();

        copy_tree(src.path(), dst.path()).unwrap();

        assert_eq!(std::fs::read(dst.path().join("core")).unwrap(), b"mine");
        assert!(dst.path().join("nested").join("x").exists());
    }
}
