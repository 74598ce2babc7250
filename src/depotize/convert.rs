use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::checksum::{self, Sha256Sums};
use crate::convert::FormatConverter;
use crate::depotize::scan::ManifestEntry;
use crate::domain::{DepotStem, MeasurementFormat};
use crate::error::DepotError;
use crate::oracle::{FormatOracle, MeasurementHandle, OracleError};
use crate::store::{CHECK_USABLE, Depot};

static MEASUREMENT_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^M(\d+)_").unwrap_or_else(|err| panic!("invalid measurement pattern: {err}"))
});

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    /// Write a new version even if the resource set already has one.
    pub supersede: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConvertAction {
    Created { version: u32 },
    Superseded { version: u32 },
    CondensedRegenerated { version: u32 },
    Unchanged { version: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertedEntry {
    pub source: PathBuf,
    pub stem: String,
    #[serde(flatten)]
    pub action: ConvertAction,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvertSummary {
    pub entries: Vec<ConvertedEntry>,
    pub failed: Vec<(PathBuf, String)>,
}

impl ConvertSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

fn oracle_error(path: &Path, err: OracleError) -> DepotError {
    match err {
        OracleError::Interrupted => DepotError::Interrupted,
        OracleError::Corrupt { message, .. } => DepotError::FormatCorruption {
            path: path.to_path_buf(),
            message,
        },
        OracleError::Failed(message) => DepotError::Oracle(message),
    }
}

fn depot_stem<O: FormatOracle>(oracle: &O, entry: &ManifestEntry) -> Result<DepotStem, DepotError> {
    let sum = checksum::sha256_file(&entry.path)?;
    let (date, time) = {
        let handle = oracle
            .open(&entry.path)
            .map_err(|err| oracle_error(&entry.path, err))?;
        let date = handle.date().map_err(|err| oracle_error(&entry.path, err))?;
        let time = handle.time().map_err(|err| oracle_error(&entry.path, err))?;
        (date, time)
    };
    DepotStem::new(&date, &time, &sum[..6])
}

/// Background images recorded next to a legacy measurement,
/// `M<n>_*.png`, in name order.
fn ancillary_images(entry: &ManifestEntry) -> Vec<(u32, PathBuf)> {
    if entry.format != MeasurementFormat::Tdms {
        return Vec::new();
    }
    let Some(name) = entry.path.file_name().and_then(|name| name.to_str()) else {
        return Vec::new();
    };
    let Some(measurement) = MEASUREMENT_NUMBER
        .captures(name)
        .and_then(|caps| caps[1].parse::<u32>().ok())
    else {
        return Vec::new();
    };
    let Some(dir) = entry.path.parent() else {
        return Vec::new();
    };
    let prefix = format!("M{measurement}_");
    let mut images = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|item| item.ok())
        .map(|item| item.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    name.starts_with(&prefix) && name.to_ascii_lowercase().ends_with(".png")
                })
        })
        .collect::<Vec<_>>();
    images.sort();
    images.into_iter().map(|path| (measurement, path)).collect()
}

struct ResourceSetWriter<'a, C: FormatConverter> {
    depot: &'a Depot,
    converter: &'a C,
    stem: DepotStem,
    sums: Sha256Sums,
}

impl<'a, C: FormatConverter> ResourceSetWriter<'a, C> {
    fn open(depot: &'a Depot, converter: &'a C, stem: DepotStem) -> Result<Self, DepotError> {
        fs::create_dir_all(depot.set_dir(&stem).as_std_path())
            .map_err(|err| DepotError::Filesystem(err.to_string()))?;
        let sums = Sha256Sums::load(depot.sha256sums_path(&stem).as_std_path())?;
        Ok(Self {
            depot,
            converter,
            stem,
            sums,
        })
    }

    /// Runs `produce` against a staging path inside the set directory and
    /// renames the result onto `dest`.
    fn publish(
        &mut self,
        dest: &Path,
        produce: impl FnOnce(&Path) -> Result<(), DepotError>,
    ) -> Result<(), DepotError> {
        let set_dir = self.depot.set_dir(&self.stem);
        let staging = Builder::new()
            .prefix(".convert-")
            .tempdir_in(set_dir.as_std_path())
            .map_err(|err| DepotError::Filesystem(err.to_string()))?;
        let name = dest
            .file_name()
            .ok_or_else(|| DepotError::Filesystem("invalid destination path".to_string()))?;
        let staged = staging.path().join(name);
        produce(&staged)?;
        let sum = checksum::sha256_file(&staged)?;
        fs::rename(&staged, dest).map_err(|err| DepotError::Filesystem(err.to_string()))?;
        self.record(&name.to_string_lossy(), &sum)
    }

    /// Adds `name` to the manifest and rewrites it on disk.
    fn record(&mut self, name: &str, sum: &str) -> Result<(), DepotError> {
        self.sums.insert(name, sum);
        self.sums
            .write(self.depot.sha256sums_path(&self.stem).as_std_path())
    }

    /// Records the primary file of an existing version when the manifest
    /// lacks it.
    fn ensure_primary_recorded(&mut self, version: u32) -> Result<(), DepotError> {
        let name = self.stem.primary_name(version);
        if self.sums.get(&name).is_some() {
            return Ok(());
        }
        let primary = self.depot.primary_path(&self.stem, version);
        let sum = checksum::sha256_file(primary.as_std_path())?;
        warn!(file = %name, "primary file missing from sha256sums, recording it");
        self.record(&name, &sum)
    }

    fn write_primary(
        &mut self,
        entry: &ManifestEntry,
        version: u32,
    ) -> Result<(), DepotError> {
        let dest = self.depot.primary_path(&self.stem, version);
        let converter = self.converter;
        self.publish(dest.as_std_path(), |staged| {
            converter.compress(&entry.path, entry.format, staged)
        })
    }

    fn write_condensed(&mut self, version: u32) -> Result<(), DepotError> {
        let primary = self.depot.primary_path(&self.stem, version);
        let dest = self.depot.condensed_path(&self.stem, version);
        let converter = self.converter;
        self.publish(dest.as_std_path(), |staged| {
            converter.condense(primary.as_std_path(), staged)
        })
    }

    fn copy_ancillary(&mut self, entry: &ManifestEntry) -> Result<(), DepotError> {
        for (index, (measurement, image)) in ancillary_images(entry).into_iter().enumerate() {
            let index = u32::try_from(index + 1).map_err(|_| {
                DepotError::InvalidInput(format!(
                    "too many ancillary images for {}",
                    entry.path.display()
                ))
            })?;
            let dest = self.depot.ancillary_path(&self.stem, index, measurement);
            if dest.as_std_path().exists() {
                continue;
            }
            self.publish(dest.as_std_path(), |staged| {
                fs::copy(&image, staged)
                    .map(|_| ())
                    .map_err(|err| DepotError::Filesystem(err.to_string()))
            })?;
        }
        Ok(())
    }
}

fn convert_entry<O: FormatOracle, C: FormatConverter>(
    entry: &ManifestEntry,
    depot: &Depot,
    oracle: &O,
    converter: &C,
    options: ConvertOptions,
) -> Result<ConvertedEntry, DepotError> {
    let stem = depot_stem(oracle, entry)?;
    let latest = depot.latest_version(&stem)?;
    let mut writer = ResourceSetWriter::open(depot, converter, stem.clone())?;

    let action = match latest {
        Some(version) if !options.supersede => {
            writer.ensure_primary_recorded(version)?;
            if depot.condensed_path(&stem, version).as_std_path().exists() {
                ConvertAction::Unchanged { version }
            } else {
                writer.write_condensed(version)?;
                ConvertAction::CondensedRegenerated { version }
            }
        }
        latest => {
            let version = latest.map_or(1, |version| version + 1);
            writer.write_primary(entry, version)?;
            writer.write_condensed(version)?;
            if latest.is_some() {
                ConvertAction::Superseded { version }
            } else {
                ConvertAction::Created { version }
            }
        }
    };
    writer.copy_ancillary(entry)?;

    Ok(ConvertedEntry {
        source: entry.path.clone(),
        stem: stem.to_string(),
        action,
    })
}

/// Converts every entry of `check_usable.txt` into the depot. Running it
/// again over the same list leaves existing resource sets untouched.
pub fn convert<O: FormatOracle, C: FormatConverter>(
    usable: &Path,
    depot: &Depot,
    oracle: &O,
    converter: &C,
    options: ConvertOptions,
    sink: &dyn ProgressSink,
) -> Result<ConvertSummary, DepotError> {
    if usable.file_name().and_then(|name| name.to_str()) != Some(CHECK_USABLE) {
        return Err(DepotError::InvalidInput(format!(
            "please specify a '{CHECK_USABLE}' file, got {}",
            usable.display()
        )));
    }
    let content = fs::read_to_string(usable).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => DepotError::NotFound(usable.to_path_buf()),
        _ => DepotError::Filesystem(err.to_string()),
    })?;

    let lines = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();
    let mut summary = ConvertSummary::default();
    for (index, line) in lines.iter().enumerate() {
        let entry = ManifestEntry::parse_line(line)?;
        sink.event(ProgressEvent::progress(format!(
            "Converting {}/{}: {}",
            index + 1,
            lines.len(),
            entry.path.display()
        )));
        match convert_entry(&entry, depot, oracle, converter, options) {
            Ok(converted) => {
                debug!(source = %entry.path.display(), stem = %converted.stem, "converted");
                summary.entries.push(converted);
            }
            Err(DepotError::Interrupted) => return Err(DepotError::Interrupted),
            Err(err) => {
                warn!(source = %entry.path.display(), error = %err, "conversion failed");
                sink.event(ProgressEvent::log(
                    1,
                    format!("!!! Conversion failed for {}: {err}", entry.path.display()),
                ));
                summary.failed.push((entry.path.clone(), err.to_string()));
            }
        }
    }
    info!(
        converted = summary.entries.len(),
        failed = summary.failed.len(),
        "conversion finished"
    );
    Ok(summary)
}
