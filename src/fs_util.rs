use std::fs;
use std::io;
use std::path::Path;

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::DepotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }
}

pub fn is_archive(path: &Path) -> bool {
    path.is_file() && ArchiveKind::from_path(path).is_some()
}

pub fn extract_archive(archive: &Path, target_dir: &Path) -> Result<(), DepotError> {
    match ArchiveKind::from_path(archive) {
        Some(ArchiveKind::Tar) => {
            let file = open(archive)?;
            extract_tar(file, target_dir)
        }
        Some(ArchiveKind::TarGz) => {
            let file = open(archive)?;
            extract_tar(GzDecoder::new(file), target_dir)
        }
        Some(ArchiveKind::Zip) => extract_zip(archive, target_dir),
        None => Err(DepotError::InvalidInput(format!(
            "unsupported archive type: {}",
            archive.display()
        ))),
    }
}

fn open(path: &Path) -> Result<fs::File, DepotError> {
    fs::File::open(path)
        .map_err(|err| DepotError::Filesystem(format!("open archive {}: {err}", path.display())))
}

fn extract_tar<R: io::Read>(reader: R, target_dir: &Path) -> Result<(), DepotError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|err| DepotError::Filesystem(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| DepotError::Filesystem(err.to_string()))?;
        // unpack_in refuses entries that would land outside target_dir
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| DepotError::Filesystem(err.to_string()))?;
        if !unpacked {
            return Err(DepotError::Filesystem(
                "tar entry path traversal detected".to_string(),
            ));
        }
    }
    Ok(())
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), DepotError> {
    let file = open(zip_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| DepotError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| DepotError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(DepotError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| DepotError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| DepotError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| DepotError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| DepotError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Writes a plain tar of the regular files directly inside `dir`, stored
/// under `<base_name>/<file>`. Subdirectories are not included.
pub fn bundle_dir_files(dir: &Path, base_name: &str, dest: &Path) -> Result<(), DepotError> {
    let mut names = fs::read_dir(dir)
        .map_err(|err| DepotError::Filesystem(err.to_string()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name())
        .collect::<Vec<_>>();
    names.sort();

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| DepotError::Filesystem(err.to_string()))?;
    }
    let out = fs::File::create(dest).map_err(|err| DepotError::Filesystem(err.to_string()))?;
    let mut builder = tar::Builder::new(out);
    for name in names {
        builder
            .append_path_with_name(dir.join(&name), Path::new(base_name).join(&name))
            .map_err(|err| DepotError::Filesystem(err.to_string()))?;
    }
    builder
        .into_inner()
        .map_err(|err| DepotError::Filesystem(err.to_string()))?;
    Ok(())
}
