use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::domain::{DepotFile, DepotStem};
use crate::error::DepotError;

pub const DATA_DIR: &str = "data";
pub const MEASUREMENTS: &str = "measurements.txt";
pub const CHECK_USABLE: &str = "check_usable.txt";
pub const CHECK_INVALID: &str = "check_invalid.txt";
pub const CHECK_VIOLATIONS: &str = "check_violations.txt";
pub const CHECK_ALERTS: &str = "check_alerts.txt";
pub const CHECK_INFO: &str = "check_info.txt";
pub const CHECK_TIMES: &str = "check_times.txt";
pub const CHECK_EXPECTED: &str = "check_expected_problems.txt";
pub const FAILED_MARKER: &str = "depotize_failed.txt";

/// Every report file the checker writes. `check_usable.txt` comes last so
/// that its presence implies the others are complete.
pub const CHECK_FILES: [&str; 7] = [
    CHECK_INFO,
    CHECK_ALERTS,
    CHECK_VIOLATIONS,
    CHECK_TIMES,
    CHECK_INVALID,
    CHECK_EXPECTED,
    CHECK_USABLE,
];

/// Staging area `<archive>_depotize/` of one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDir {
    root: PathBuf,
}

impl WorkingDir {
    /// Derives the working directory of `archive`. The archive must be an
    /// existing regular file.
    pub fn for_archive(archive: &Path) -> Result<Self, DepotError> {
        if !archive.exists() {
            return Err(DepotError::NotFound(archive.to_path_buf()));
        }
        if archive.is_dir() {
            return Err(DepotError::InvalidInput(format!(
                "file must be an archive, got a directory: {}",
                archive.display()
            )));
        }
        let name = archive
            .file_name()
            .ok_or_else(|| DepotError::InvalidInput(format!("invalid archive path: {}", archive.display())))?;
        let mut dir_name = name.to_os_string();
        dir_name.push("_depotize");
        Ok(Self {
            root: archive.with_file_name(dir_name),
        })
    }

    /// Working directory rooted at the parent of a report file.
    pub fn from_report(report: &Path) -> Result<Self, DepotError> {
        let root = report.parent().ok_or_else(|| {
            DepotError::InvalidInput(format!("report has no parent directory: {}", report.display()))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn measurements(&self) -> PathBuf {
        self.file(MEASUREMENTS)
    }

    pub fn is_unpacked(&self) -> bool {
        self.data_dir().is_dir()
    }

    pub fn is_checked(&self) -> bool {
        CHECK_FILES.iter().all(|name| self.file(name).is_file())
    }

    pub fn failed_marker(&self) -> PathBuf {
        self.file(FAILED_MARKER)
    }

    pub fn is_marked_failed(&self) -> bool {
        self.failed_marker().is_file()
    }
}

/// Canonical on-disk depot of converted resource sets.
#[derive(Debug, Clone)]
pub struct Depot {
    root: Utf8PathBuf,
}

impl Depot {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn set_dir(&self, stem: &DepotStem) -> Utf8PathBuf {
        self.root.join(stem.depot_subdir())
    }

    pub fn sha256sums_path(&self, stem: &DepotStem) -> Utf8PathBuf {
        self.set_dir(stem).join(stem.sha256sums_name())
    }

    pub fn primary_path(&self, stem: &DepotStem, version: u32) -> Utf8PathBuf {
        self.set_dir(stem).join(stem.primary_name(version))
    }

    pub fn condensed_path(&self, stem: &DepotStem, version: u32) -> Utf8PathBuf {
        self.set_dir(stem).join(stem.condensed_name(version))
    }

    pub fn ancillary_path(&self, stem: &DepotStem, index: u32, measurement: u32) -> Utf8PathBuf {
        self.set_dir(stem).join(stem.ancillary_name(index, measurement))
    }

    /// Highest primary version present for `stem`, if any.
    pub fn latest_version(&self, stem: &DepotStem) -> Result<Option<u32>, DepotError> {
        let dir = self.set_dir(stem);
        if !dir.as_std_path().exists() {
            return Ok(None);
        }
        let mut latest = None;
        let entries =
            fs::read_dir(dir.as_std_path()).map_err(|err| DepotError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| DepotError::Filesystem(err.to_string()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((found, DepotFile::Primary { version })) = DepotFile::parse(name) {
                if &found == stem && latest.is_none_or(|current| version > current) {
                    latest = Some(version);
                }
            }
        }
        Ok(latest)
    }
}

pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), DepotError> {
    let parent = path
        .parent()
        .ok_or_else(|| DepotError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent).map_err(|err| DepotError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix(".dcor-depot")
        .tempfile_in(parent)
        .map_err(|err| DepotError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| DepotError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| DepotError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn copy_file_atomic(source: &Path, dest: &Path) -> Result<(), DepotError> {
    let parent = dest
        .parent()
        .ok_or_else(|| DepotError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent).map_err(|err| DepotError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix(".dcor-depot-file")
        .tempfile_in(parent)
        .map_err(|err| DepotError::Filesystem(err.to_string()))?;
    fs::copy(source, temp.path()).map_err(|err| DepotError::Filesystem(err.to_string()))?;
    temp.persist(dest)
        .map_err(|err| DepotError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Moves a file, falling back to copy + remove across filesystems.
pub fn move_file(source: &Path, dest: &Path) -> Result<(), DepotError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| DepotError::Filesystem(err.to_string()))?;
    }
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            copy_file_atomic(source, dest)?;
            fs::remove_file(source).map_err(|err| DepotError::Filesystem(err.to_string()))
        }
        Err(err) => Err(DepotError::Filesystem(format!(
            "move {} -> {}: {err}",
            source.display(),
            dest.display()
        ))),
    }
}

/// Renames `from` onto `to` unless `to` already exists. Returns `false`
/// (and leaves `from` in place) when another writer got there first.
pub fn rename_dir_if_absent(from: &Path, to: &Path) -> io::Result<bool> {
    if to.exists() {
        return Ok(false);
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(true),
        Err(_) if to.is_dir() => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn working_dir_layout() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("2019-08.tar");
        fs::write(&archive, b"x").unwrap();

        let wd = WorkingDir::for_archive(&archive).unwrap();
        assert!(wd.root().ends_with("2019-08.tar_depotize"));
        assert!(wd.data_dir().ends_with("2019-08.tar_depotize/data"));
        assert!(wd.measurements().ends_with("measurements.txt"));
        assert!(!wd.is_unpacked());
    }

    #[test]
    fn working_dir_rejects_directories() {
        let temp = tempfile::tempdir().unwrap();
        let err = WorkingDir::for_archive(temp.path()).unwrap_err();
        assert_matches!(err, DepotError::InvalidInput(_));

        let err = WorkingDir::for_archive(&temp.path().join("missing.tar")).unwrap_err();
        assert_matches!(err, DepotError::NotFound(_));
    }

    #[test]
    fn latest_version_ignores_condensed_and_other_stems() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let depot = Depot::new(root);
        let stem = DepotStem::new("2019-08-20", "1126", "c083de").unwrap();
        let other = DepotStem::new("2019-08-20", "1126", "ffffff").unwrap();
        assert_eq!(depot.latest_version(&stem).unwrap(), None);

        for path in [
            depot.primary_path(&stem, 1),
            depot.primary_path(&stem, 2),
            depot.condensed_path(&stem, 5),
            depot.primary_path(&other, 9),
        ] {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path.as_std_path(), b"").unwrap();
        }
        assert_eq!(depot.latest_version(&stem).unwrap(), Some(2));
    }
}
