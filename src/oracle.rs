use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DepotError;
use crate::tools::{self, ToolExit};

/// Recognized ways in which a measurement file can be broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptionKind {
    InvalidTdms,
    IncompleteTdms,
    ContourIndexing,
    InvalidVideo,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CorruptionKind::InvalidTdms => "invalid-tdms",
            CorruptionKind::IncompleteTdms => "incomplete-tdms",
            CorruptionKind::ContourIndexing => "contour-indexing",
            CorruptionKind::InvalidVideo => "invalid-video",
        };
        f.write_str(label)
    }
}

impl FromStr for CorruptionKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "invalid-tdms" => Ok(CorruptionKind::InvalidTdms),
            "incomplete-tdms" => Ok(CorruptionKind::IncompleteTdms),
            "contour-indexing" => Ok(CorruptionKind::ContourIndexing),
            "invalid-video" => Ok(CorruptionKind::InvalidVideo),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("{kind}: {message}")]
    Corrupt {
        kind: CorruptionKind,
        message: String,
    },

    #[error("interrupted")]
    Interrupted,

    #[error("{0}")]
    Failed(String),
}

/// Outcome of the format library's rule check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    #[serde(default)]
    pub violations: BTreeSet<String>,
    #[serde(default)]
    pub alerts: BTreeSet<String>,
    #[serde(default)]
    pub info: BTreeSet<String>,
}

/// An opened measurement. Whatever the handle holds is released on drop.
pub trait MeasurementHandle {
    /// Number of events.
    fn length(&self) -> usize;
    /// Acquisition date as `YYYY-MM-DD`.
    fn date(&self) -> Result<String, OracleError>;
    /// Acquisition time of day, `HH:MM` or `HH:MM:SS`.
    fn time(&self) -> Result<String, OracleError>;
    fn validate(&self) -> Result<CheckReport, OracleError>;
}

pub trait FormatOracle: Send + Sync {
    type Handle: MeasurementHandle;

    fn open(&self, path: &Path) -> Result<Self::Handle, OracleError>;
}

/// Oracle backed by an inspection tool that prints one JSON document per
/// measurement. A failing run whose stderr starts with `corrupt:<kind>:` is
/// reported as [`OracleError::Corrupt`].
#[derive(Debug, Clone)]
pub struct CommandOracle {
    program: PathBuf,
}

impl CommandOracle {
    pub fn new(tool: &str) -> Result<Self, DepotError> {
        Ok(Self {
            program: tools::require_tool(tool)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InspectedMeasurement {
    pub events: usize,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(flatten)]
    pub report: CheckReport,
}

impl MeasurementHandle for InspectedMeasurement {
    fn length(&self) -> usize {
        self.events
    }

    fn date(&self) -> Result<String, OracleError> {
        self.date
            .clone()
            .ok_or_else(|| OracleError::Failed("measurement has no [experiment] date".to_string()))
    }

    fn time(&self) -> Result<String, OracleError> {
        self.time
            .clone()
            .ok_or_else(|| OracleError::Failed("measurement has no [experiment] time".to_string()))
    }

    fn validate(&self) -> Result<CheckReport, OracleError> {
        Ok(self.report.clone())
    }
}

impl FormatOracle for CommandOracle {
    type Handle = InspectedMeasurement;

    fn open(&self, path: &Path) -> Result<Self::Handle, OracleError> {
        let exit = tools::run_tool(&self.program, &[path])
            .map_err(|err| OracleError::Failed(err.to_string()))?;
        match exit {
            ToolExit::Success(output) => serde_json::from_slice(&output.stdout)
                .map_err(|err| OracleError::Failed(format!("unreadable inspect output: {err}"))),
            ToolExit::Interrupted => Err(OracleError::Interrupted),
            ToolExit::Failed { stderr, .. } => Err(parse_failure(&stderr)),
        }
    }
}

fn parse_failure(stderr: &str) -> OracleError {
    let first = stderr.lines().next().unwrap_or_default();
    if let Some(rest) = first.strip_prefix("corrupt:") {
        let (kind, message) = rest.split_once(':').unwrap_or((rest, ""));
        if let Ok(kind) = kind.parse() {
            return OracleError::Corrupt {
                kind,
                message: message.trim().to_string(),
            };
        }
    }
    OracleError::Failed(stderr.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_inspect_output() {
        let json = r#"{
            "events": 200,
            "date": "2019-08-20",
            "time": "11:26:03",
            "violations": ["Features: wrong event count: 'image' (190 of 200)"],
            "alerts": [],
            "info": ["Fluorescence: channel count 0"]
        }"#;
        let measurement: InspectedMeasurement = serde_json::from_str(json).unwrap();
        assert_eq!(measurement.length(), 200);
        assert_eq!(measurement.date().unwrap(), "2019-08-20");
        let report = measurement.validate().unwrap();
        assert_eq!(report.violations.len(), 1);
        assert!(report.alerts.is_empty());
        assert_eq!(report.info.len(), 1);
    }

    #[test]
    fn corruption_is_recognized_from_stderr() {
        let err = parse_failure("corrupt:incomplete-tdms: missing M1_para.ini\ntrace");
        assert_matches!(
            err,
            OracleError::Corrupt {
                kind: CorruptionKind::IncompleteTdms,
                ..
            }
        );

        let err = parse_failure("corrupt:unheard-of: boom");
        assert_matches!(err, OracleError::Failed(_));
    }
}
