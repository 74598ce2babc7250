use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{FileClass, MeasurementFormat};
use crate::error::DepotError;
use crate::store::{self, MEASUREMENTS};

const ANCILLARY_EXTENSIONS: &[&str] = &[
    "ini", "txt", "log", "csv", "tsv", "png", "jpg", "jpeg", "bmp", "tif", "tiff", "pdf", "md",
    "doc", "docx", "xls", "xlsx", "pptx", "json", "xml",
];
const ANCILLARY_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

/// Legacy companion files that must exist next to `M<n>_data.tdms`.
const LEGACY_REQUIRED: &[&str] = &["para.ini", "camera.ini"];

/// One line of `measurements.txt`: `<path>\t<format>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub format: MeasurementFormat,
}

impl ManifestEntry {
    pub fn to_line(&self) -> String {
        format!("{}\t{}", self.path.display(), self.format)
    }

    /// Parses a manifest line. A missing format column is inferred from the
    /// file extension.
    pub fn parse_line(line: &str) -> Result<Self, DepotError> {
        let mut columns = line.trim_end_matches(['\r', '\n']).split('\t');
        let path = columns
            .next()
            .filter(|path| !path.trim().is_empty())
            .ok_or_else(|| DepotError::InvalidInput(format!("empty manifest line: {line:?}")))?;
        let format = match columns.next() {
            Some(format) => format.parse()?,
            None if path.ends_with(".tdms") => MeasurementFormat::Tdms,
            None => MeasurementFormat::Rtdc,
        };
        Ok(Self {
            path: PathBuf::from(path),
            format,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// A legacy measurement lacks a required companion file.
    Incomplete,
    /// A legacy measurement already has an exported `.rtdc` next to it.
    Duplicate,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::Incomplete => write!(f, "incomplete"),
            ExclusionReason::Duplicate => write!(f, "duplicate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub path: PathBuf,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanResult {
    pub measurements: Vec<ManifestEntry>,
    pub excluded: Vec<Exclusion>,
    pub unknown: Vec<PathBuf>,
    /// Bucket of every walked file.
    pub classes: BTreeMap<PathBuf, FileClass>,
}

impl ScanResult {
    pub fn datasets_found(&self) -> usize {
        self.measurements.len()
    }

    pub fn datasets_excluded(&self) -> usize {
        self.excluded.len()
    }

    pub fn files_unknown(&self) -> usize {
        self.unknown.len()
    }
}

/// Scans `data_dir` and writes `measurements.txt` next to it.
pub fn scan(data_dir: &Path, sink: &dyn ProgressSink) -> Result<ScanResult, DepotError> {
    let result = classify_tree(data_dir)?;
    let manifest_path = data_dir
        .parent()
        .ok_or_else(|| DepotError::InvalidInput(format!("invalid data dir: {}", data_dir.display())))?
        .join(MEASUREMENTS);

    let mut content = String::new();
    for entry in &result.measurements {
        content.push_str(&entry.to_line());
        content.push('\n');
    }
    store::write_bytes_atomic(&manifest_path, content.as_bytes())?;

    for exclusion in &result.excluded {
        sink.event(ProgressEvent::log(
            2,
            format!("Excluded ({}): {}", exclusion.reason, exclusion.path.display()),
        ));
    }
    for path in &result.unknown {
        warn!(path = %path.display(), "unknown file");
        sink.event(ProgressEvent::log(1, format!("Unknown file: {}", path.display())));
    }
    info!(
        found = result.datasets_found(),
        excluded = result.datasets_excluded(),
        unknown = result.files_unknown(),
        "scan finished"
    );
    sink.event(ProgressEvent::log(
        1,
        format!(
            "Found {} datasets, excluded {}, {} unknown files",
            result.datasets_found(),
            result.datasets_excluded(),
            result.files_unknown()
        ),
    ));
    Ok(result)
}

/// Puts every file below `data_dir` into exactly one [`FileClass`] bucket.
pub fn classify_tree(data_dir: &Path) -> Result<ScanResult, DepotError> {
    if !data_dir.is_dir() {
        return Err(DepotError::NotFound(data_dir.to_path_buf()));
    }
    let legacy_name = Regex::new(r"^M(\d+)_(.+)$")
        .map_err(|err| DepotError::InvalidInput(err.to_string()))?;

    let mut files = Vec::new();
    for entry in WalkDir::new(data_dir).sort_by_file_name() {
        let entry = entry.map_err(|err| DepotError::Filesystem(err.to_string()))?;
        if !entry.file_type().is_dir() {
            files.push(entry.into_path());
        }
    }

    // (directory, measurement number) of every legacy data file and of
    // every exported rtdc file that shares the measurement prefix
    let mut legacy = HashSet::new();
    let mut exported = HashSet::new();
    for path in &files {
        let (Some(dir), Some(name)) = (path.parent(), file_name(path)) else {
            continue;
        };
        if let Some(caps) = legacy_name.captures(name) {
            let key = (dir.to_path_buf(), caps[1].to_string());
            if &caps[2] == "data.tdms" {
                legacy.insert(key);
            } else if is_rtdc(name) && !is_condensed(name) {
                exported.insert(key);
            }
        }
    }

    let mut result = ScanResult::default();
    for path in files {
        let class = match (path.parent(), file_name(&path)) {
            (Some(dir), Some(name)) => {
                let legacy_key = legacy_name
                    .captures(name)
                    .map(|caps| ((dir.to_path_buf(), caps[1].to_string()), caps[2].to_string()));
                if is_condensed(name) {
                    FileClass::Ancillary
                } else if is_rtdc(name) {
                    result.measurements.push(ManifestEntry {
                        path: path.clone(),
                        format: MeasurementFormat::Rtdc,
                    });
                    FileClass::Measurement(MeasurementFormat::Rtdc)
                } else if let Some((key, rest)) = legacy_key {
                    if rest == "data.tdms" {
                        if exported.contains(&key) {
                            result.excluded.push(Exclusion {
                                path: path.clone(),
                                reason: ExclusionReason::Duplicate,
                            });
                        } else if !has_legacy_companions(dir, &key.1) {
                            result.excluded.push(Exclusion {
                                path: path.clone(),
                                reason: ExclusionReason::Incomplete,
                            });
                        } else {
                            result.measurements.push(ManifestEntry {
                                path: path.clone(),
                                format: MeasurementFormat::Tdms,
                            });
                        }
                        FileClass::Measurement(MeasurementFormat::Tdms)
                    } else if legacy.contains(&key) {
                        FileClass::Companion
                    } else {
                        // part of a legacy measurement whose data file is missing
                        FileClass::Unknown
                    }
                } else if is_ancillary(name) {
                    FileClass::Ancillary
                } else {
                    FileClass::Unknown
                }
            }
            // non-UTF-8 names cannot go into the manifest
            _ => FileClass::Unknown,
        };
        if class == FileClass::Unknown {
            result.unknown.push(path.clone());
        }
        debug!(path = %path.display(), ?class, "classified");
        result.classes.insert(path, class);
    }
    Ok(result)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
}

fn is_rtdc(name: &str) -> bool {
    extension(name).as_deref() == Some("rtdc")
}

fn is_condensed(name: &str) -> bool {
    name.to_lowercase().ends_with("_condensed.rtdc")
}

fn is_ancillary(name: &str) -> bool {
    ANCILLARY_NAMES.contains(&name)
        || extension(name).is_some_and(|ext| ANCILLARY_EXTENSIONS.contains(&ext.as_str()))
}

fn has_legacy_companions(dir: &Path, number: &str) -> bool {
    LEGACY_REQUIRED
        .iter()
        .all(|suffix| fs::metadata(dir.join(format!("M{number}_{suffix}"))).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::NullSink;

    fn touch(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn every_file_lands_in_one_bucket() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        let files = [
            "2019-08-20/flow/M1_data.tdms",
            "2019-08-20/flow/M1_para.ini",
            "2019-08-20/flow/M1_camera.ini",
            "2019-08-20/flow/M1_imaq.avi",
            "2019-08-20/flow/M2_data.tdms",
            "2019-08-20/flow/M3_imaq.avi",
            "2019-08-20/export/M1_data.tdms",
            "2019-08-20/export/M1_para.ini",
            "2019-08-20/export/M1_camera.ini",
            "2019-08-20/export/M1_dcn.rtdc",
            "2019-08-20/export/M1_dcn_condensed.rtdc",
            "2019-08-21/sample.rtdc",
            "2019-08-21/notes.txt",
            "2019-08-21/.DS_Store",
            "2019-08-21/script.py",
        ];
        for rel in files {
            touch(&data, rel);
        }

        let result = classify_tree(&data).unwrap();
        assert_eq!(result.classes.len(), files.len());
        let class = |rel: &str| result.classes[&data.join(rel)];

        assert_eq!(
            class("2019-08-20/flow/M1_data.tdms"),
            FileClass::Measurement(MeasurementFormat::Tdms)
        );
        assert_eq!(class("2019-08-20/flow/M1_imaq.avi"), FileClass::Companion);
        assert_eq!(class("2019-08-20/flow/M3_imaq.avi"), FileClass::Unknown);
        assert_eq!(
            class("2019-08-20/export/M1_dcn_condensed.rtdc"),
            FileClass::Ancillary
        );
        assert_eq!(class("2019-08-21/.DS_Store"), FileClass::Ancillary);
        assert_eq!(class("2019-08-21/script.py"), FileClass::Unknown);

        let found = result
            .measurements
            .iter()
            .map(|entry| entry.path.strip_prefix(&data).unwrap().to_path_buf())
            .collect::<Vec<_>>();
        assert_eq!(
            found,
            vec![
                PathBuf::from("2019-08-20/export/M1_dcn.rtdc"),
                PathBuf::from("2019-08-20/flow/M1_data.tdms"),
                PathBuf::from("2019-08-21/sample.rtdc"),
            ]
        );
        assert_eq!(
            result.excluded,
            vec![
                Exclusion {
                    path: data.join("2019-08-20/export/M1_data.tdms"),
                    reason: ExclusionReason::Duplicate,
                },
                Exclusion {
                    path: data.join("2019-08-20/flow/M2_data.tdms"),
                    reason: ExclusionReason::Incomplete,
                },
            ]
        );
        assert_eq!(result.files_unknown(), 2);
    }

    #[test]
    fn scan_writes_manifest_next_to_data() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        let rtdc = touch(&data, "a/one.rtdc");

        let result = scan(&data, &NullSink).unwrap();
        assert_eq!(result.datasets_found(), 1);
        let manifest = fs::read_to_string(temp.path().join(MEASUREMENTS)).unwrap();
        assert_eq!(manifest, format!("{}\trtdc\n", rtdc.display()));
    }

    #[test]
    fn manifest_line_round_trip_and_inference() {
        let entry = ManifestEntry::parse_line("/x/M1_data.tdms\ttdms").unwrap();
        assert_eq!(entry.format, MeasurementFormat::Tdms);
        assert_eq!(entry.to_line(), "/x/M1_data.tdms\ttdms");

        let entry = ManifestEntry::parse_line("/x/M1_data.tdms").unwrap();
        assert_eq!(entry.format, MeasurementFormat::Tdms);
        assert!(ManifestEntry::parse_line("\tttdms").is_err());
    }
}
