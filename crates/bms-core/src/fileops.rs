//! Filesystem seam used by the engines.
//!
//! Every mutation the install transaction performs on disk goes through
//! [`FileOps`], so tests and rollback handling can observe and substitute
//! them. [`HostFileOps`] is the real implementation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use bms_domain::{InstallError, InstallResult};

pub trait FileOps: Send + Sync {
    fn create_dir(&self, path: &Path) -> InstallResult<()>;
    /// Extracts every entry of the archive below `target`.
    fn extract_archive(&self, archive: &Path, target: &Path) -> InstallResult<()>;
    fn rename_dir(&self, from: &Path, to: &Path) -> InstallResult<()>;
    /// Recursive removal; a missing path is not an error.
    fn remove_dir(&self, path: &Path) -> InstallResult<()>;
    fn copy_file(&self, from: &Path, to: &Path) -> InstallResult<()>;
    /// Bytes available on the filesystem holding `path`.
    fn available_space(&self, path: &Path) -> InstallResult<u64>;

    /// Fails when the filesystem holding `path` cannot take `needed` bytes.
    fn check_disk_space(&self, path: &Path, needed: u64) -> InstallResult<()> {
        if self.available_space(path)? < needed {
            return Err(InstallError::DiskSpaceInsufficient(
                path.display().to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct HostFileOps;

impl FileOps for HostFileOps {
    fn create_dir(&self, path: &Path) -> InstallResult<()> {
        fs::create_dir_all(path).map_err(|err| io_error("create_dir", path, &err))
    }

    fn extract_archive(&self, archive: &Path, target: &Path) -> InstallResult<()> {
        let file = fs::File::open(archive).map_err(|err| io_error("open", archive, &err))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|_| InstallError::InvalidBundleFile {
            path: archive.display().to_string(),
        })?;
        fs::create_dir_all(target).map_err(|err| io_error("create_dir", target, &err))?;
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|err| InstallError::ParseUnexpected(err.to_string()))?;
            // Entries with traversal components are silently dropped.
            let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                continue;
            };
            let out = target.join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&out).map_err(|err| io_error("create_dir", &out, &err))?;
                continue;
            }
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).map_err(|err| io_error("create_dir", parent, &err))?;
            }
            let mut dest = fs::File::create(&out).map_err(|err| io_error("create", &out, &err))?;
            io::copy(&mut entry, &mut dest).map_err(|err| io_error("write", &out, &err))?;
        }
        debug!(archive = %archive.display(), target = %target.display(), "archive extracted");
        Ok(())
    }

    fn rename_dir(&self, from: &Path, to: &Path) -> InstallResult<()> {
        fs::rename(from, to).map_err(|err| io_error("rename", from, &err))
    }

    fn remove_dir(&self, path: &Path) -> InstallResult<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("remove_dir", path, &err)),
        }
    }

    fn copy_file(&self, from: &Path, to: &Path) -> InstallResult<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error("create_dir", parent, &err))?;
        }
        fs::copy(from, to)
            .map(|_| ())
            .map_err(|err| io_error("copy", from, &err))
    }

    fn available_space(&self, path: &Path) -> InstallResult<u64> {
        let probe = nearest_existing(path);
        fs4::available_space(&probe).map_err(|err| io_error("statfs", &probe, &err))
    }
}

/// Walks up until an existing ancestor is found, so space can be probed for
/// directories that are about to be created.
fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path;
    while !current.exists() {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current.to_path_buf()
}

fn io_error(op: &'static str, path: &Path, err: &io::Error) -> InstallError {
    InstallError::FileOperationFailed {
        op,
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    #[test]
    fn extraction_recreates_the_archive_layout() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("pkg.hap");
        let mut writer = zip::ZipWriter::new(fs::File::create(&archive).unwrap());
        writer.start_file("module.json", FileOptions::default()).unwrap();
        writer.write_all(b"{}").unwrap();
        writer
            .start_file("libs/arm64/libdemo.so", FileOptions::default())
            .unwrap();
        writer.write_all(b"\x7fELF").unwrap();
        writer.finish().unwrap();

        let target = temp.path().join("out");
        HostFileOps.extract_archive(&archive, &target).unwrap();
        assert!(target.join("module.json").is_file());
        assert!(target.join("libs/arm64/libdemo.so").is_file());
    }

    #[test]
    fn remove_dir_tolerates_missing_paths() {
        let temp = tempfile::tempdir().unwrap();
        HostFileOps.remove_dir(&temp.path().join("absent")).unwrap();
    }

    #[test]
    fn disk_space_probe_walks_to_an_existing_ancestor() {
        let temp = tempfile::tempdir().unwrap();
        let deep = temp.path().join("a/b/c");
        assert!(HostFileOps.available_space(&deep).unwrap() > 0);
        HostFileOps.check_disk_space(&deep, 1).unwrap();
        assert!(matches!(
            HostFileOps.check_disk_space(&deep, u64::MAX).unwrap_err(),
            InstallError::DiskSpaceInsufficient(_)
        ));
    }
}
