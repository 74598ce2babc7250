//! The depotize pipeline: unpack, scan, check and convert one archive (or
//! every archive below a directory) into the canonical depot.
//!
//! Progress is checkpointed in `<archive>_depotize/`: each stage leaves
//! files behind that let a later run skip it.

pub mod check;
pub mod convert;
pub mod scan;
pub mod unpack;

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Datelike;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::app::{ProgressEvent, ProgressSink};
use crate::config::{ArchivePaths, CheckPolicy};
use crate::convert::FormatConverter;
use crate::error::DepotError;
use crate::fs_util;
use crate::oracle::FormatOracle;
use crate::store::{self, CHECK_USABLE, Depot, WorkingDir};

pub use check::CheckResults;
pub use convert::{ConvertOptions, ConvertSummary};
pub use scan::ScanResult;

const WORKING_DIR_SUFFIX: &str = "_depotize";

#[derive(Debug, Clone, Copy)]
pub struct DepotizeOptions {
    pub cleanup: bool,
    pub skip_failed: bool,
    pub abort_on_unknown: bool,
    pub supersede: bool,
}

impl Default for DepotizeOptions {
    fn default() -> Self {
        Self {
            cleanup: false,
            skip_failed: false,
            abort_on_unknown: true,
            supersede: false,
        }
    }
}

/// Last pipeline state an archive reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    Pending,
    Unpacked,
    Scanned,
    Checked,
    Converted,
    Cleaned,
    ArchivedWithError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Completed,
    /// Marked failed by an earlier run and `skip_failed` is set.
    Skipped,
    /// Unknown files were found and the pipeline stopped before checking.
    Halted { unknown: Vec<PathBuf> },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub archive: PathBuf,
    pub state: ArchiveState,
    #[serde(flatten)]
    pub outcome: ArchiveOutcome,
    pub usable: usize,
    pub invalid: usize,
    pub converted: usize,
}

impl ArchiveReport {
    fn new(archive: &Path) -> Self {
        Self {
            archive: archive.to_path_buf(),
            state: ArchiveState::Pending,
            outcome: ArchiveOutcome::Completed,
            usable: 0,
            invalid: 0,
            converted: 0,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.outcome, ArchiveOutcome::Halted { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DepotizeSummary {
    pub archives: Vec<ArchiveReport>,
}

impl DepotizeSummary {
    pub fn count(&self, matches: impl Fn(&ArchiveOutcome) -> bool) -> usize {
        self.archives
            .iter()
            .filter(|report| matches(&report.outcome))
            .count()
    }
}

/// Drives archives through the pipeline.
pub struct Depotizer<'a, O: FormatOracle, C: FormatConverter> {
    oracle: &'a O,
    converter: &'a C,
    depot: Depot,
    policy: CheckPolicy,
    archive_paths: ArchivePaths,
    options: DepotizeOptions,
}

impl<'a, O: FormatOracle, C: FormatConverter> Depotizer<'a, O, C> {
    pub fn new(
        oracle: &'a O,
        converter: &'a C,
        depot: Depot,
        policy: CheckPolicy,
        archive_paths: ArchivePaths,
        options: DepotizeOptions,
    ) -> Self {
        Self {
            oracle,
            converter,
            depot,
            policy,
            archive_paths,
            options,
        }
    }

    /// Depotizes a single archive, or every archive found below a
    /// directory. In a directory sweep, failures of one archive are
    /// recorded and the sweep moves on; only an interrupt stops it.
    pub fn run(&self, path: &Path, sink: &dyn ProgressSink) -> Result<DepotizeSummary, DepotError> {
        if !path.exists() {
            return Err(DepotError::NotFound(path.to_path_buf()));
        }
        if !path.is_dir() {
            let report = self.depotize_archive(path, sink)?;
            return Ok(DepotizeSummary {
                archives: vec![report],
            });
        }

        let archives = find_archives(path);
        info!(root = %path.display(), count = archives.len(), "depotizing archive tree");
        let mut summary = DepotizeSummary::default();
        for archive in archives {
            sink.event(ProgressEvent::log(1, format!("Processing {}", archive.display())));
            match self.depotize_archive(&archive, sink) {
                Ok(report) => summary.archives.push(report),
                Err(DepotError::Interrupted) => return Err(DepotError::Interrupted),
                Err(err) => {
                    warn!(archive = %archive.display(), error = %err, "archive failed");
                    sink.event(ProgressEvent::log(
                        0,
                        format!("!!! {}: {err}", archive.display()),
                    ));
                    let mut report = ArchiveReport::new(&archive);
                    report.outcome = ArchiveOutcome::Failed {
                        message: err.to_string(),
                    };
                    summary.archives.push(report);
                }
            }
        }
        Ok(summary)
    }

    pub fn depotize_archive(
        &self,
        archive: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<ArchiveReport, DepotError> {
        let working_dir = WorkingDir::for_archive(archive)?;
        let mut report = ArchiveReport::new(archive);

        let retrying = working_dir.is_marked_failed();
        if retrying {
            if self.options.skip_failed {
                sink.event(ProgressEvent::log(
                    1,
                    format!("Skipping previously failed {}", archive.display()),
                ));
                report.outcome = ArchiveOutcome::Skipped;
                return Ok(report);
            }
            fs::remove_file(working_dir.failed_marker())
                .map_err(|err| DepotError::Filesystem(err.to_string()))?;
            info!(archive = %archive.display(), "retrying previously failed archive");
        }

        let data_dir = unpack::unpack(archive, sink)?;
        report.state = ArchiveState::Unpacked;

        if working_dir.is_checked() && !retrying {
            sink.event(ProgressEvent::log(
                1,
                "Skipping scan and check, because the check reports exist.",
            ));
            report.state = ArchiveState::Checked;
            report.usable = count_lines(&working_dir.file(CHECK_USABLE))?;
        } else {
            let scanned = scan::scan(&data_dir, sink)?;
            report.state = ArchiveState::Scanned;
            if !scanned.unknown.is_empty() && self.options.abort_on_unknown {
                write_failed_marker(&working_dir, &scanned.unknown)?;
                let error = DepotError::UnknownFiles {
                    archive: archive.to_path_buf(),
                    count: scanned.unknown.len(),
                };
                warn!(archive = %archive.display(), unknown = scanned.unknown.len(), "halting");
                sink.event(ProgressEvent::log(0, format!("!!! {error}")));
                report.outcome = ArchiveOutcome::Halted {
                    unknown: scanned.unknown,
                };
                return Ok(report);
            }

            let checked = check::check(&working_dir.measurements(), self.oracle, &self.policy, sink)?;
            report.state = ArchiveState::Checked;
            report.usable = checked.usable.len();
            report.invalid = checked.invalid.len();
        }

        let converted = convert::convert(
            &working_dir.file(CHECK_USABLE),
            &self.depot,
            self.oracle,
            self.converter,
            ConvertOptions {
                supersede: self.options.supersede,
            },
            sink,
        )?;
        report.converted = converted.entries.len();
        report.state = ArchiveState::Converted;

        if !converted.is_success() {
            report.state = ArchiveState::ArchivedWithError;
            report.outcome = ArchiveOutcome::Failed {
                message: format!("{} entries failed to convert", converted.failed.len()),
            };
            return Ok(report);
        }

        if self.options.cleanup {
            self.cleanup(archive, &working_dir, sink)?;
            report.state = ArchiveState::Cleaned;
        }
        sink.event(ProgressEvent::log(
            1,
            format!(
                "Depotized {} ({} usable, {} converted)",
                archive.display(),
                report.usable,
                report.converted
            ),
        ));
        Ok(report)
    }

    /// Removes the extracted payload, files the archive under the
    /// processed area, and keeps a tar of the reports under the archived
    /// metadata area.
    fn cleanup(
        &self,
        archive: &Path,
        working_dir: &WorkingDir,
        sink: &dyn ProgressSink,
    ) -> Result<(), DepotError> {
        let name = archive
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| DepotError::InvalidInput(format!("{}", archive.display())))?;
        let year = archive_year(name);
        sink.event(ProgressEvent::progress(format!("Cleaning up {name}")));

        let data_dir = working_dir.data_dir();
        if data_dir.exists() {
            fs::remove_dir_all(&data_dir).map_err(|err| DepotError::Filesystem(err.to_string()))?;
        }

        let processed = self
            .archive_paths
            .processed
            .as_std_path()
            .join(&year)
            .join(name);
        store::move_file(archive, &processed)?;

        let meta_tar = self
            .archive_paths
            .archived_meta
            .as_std_path()
            .join(&year)
            .join(format!("{name}_meta.tar"));
        let base_name = format!("{name}{WORKING_DIR_SUFFIX}");
        let staging = tempfile::Builder::new()
            .prefix(".meta-")
            .tempdir_in(working_dir.root())
            .map_err(|err| DepotError::Filesystem(err.to_string()))?;
        let staged = staging.path().join("meta.tar");
        fs_util::bundle_dir_files(working_dir.root(), &base_name, &staged)?;
        store::copy_file_atomic(&staged, &meta_tar)?;
        drop(staging);

        fs::remove_dir_all(working_dir.root())
            .map_err(|err| DepotError::Filesystem(err.to_string()))?;
        info!(
            archive = %processed.display(),
            meta = %meta_tar.display(),
            "cleaned up working directory"
        );
        Ok(())
    }
}

/// Year used for the dated processed/archived areas: the leading digits of
/// the archive name when present, otherwise the current year.
fn archive_year(name: &str) -> String {
    match name.get(..4) {
        Some(prefix) if prefix.chars().all(|ch| ch.is_ascii_digit()) => prefix.to_string(),
        _ => chrono::Local::now().year().to_string(),
    }
}

/// Archive files below `root`, skipping anything inside a working directory.
fn find_archives(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(WORKING_DIR_SUFFIX)))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && fs_util::is_archive(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

fn write_failed_marker(working_dir: &WorkingDir, unknown: &[PathBuf]) -> Result<(), DepotError> {
    let mut content = format!("Found {} unknown file(s):\n", unknown.len());
    for path in unknown {
        let _ = writeln!(content, "{}", path.display());
    }
    store::write_bytes_atomic(&working_dir.failed_marker(), content.as_bytes())
}

fn count_lines(path: &Path) -> Result<usize, DepotError> {
    let content =
        fs::read_to_string(path).map_err(|err| DepotError::Filesystem(err.to_string()))?;
    Ok(content.lines().filter(|line| !line.trim().is_empty()).count())
}
