use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::config::CheckPolicy;
use crate::depotize::scan::ManifestEntry;
use crate::error::DepotError;
use crate::oracle::{CheckReport, CorruptionKind, FormatOracle, MeasurementHandle, OracleError};
use crate::store::{
    self, CHECK_ALERTS, CHECK_EXPECTED, CHECK_INFO, CHECK_INVALID, CHECK_TIMES, CHECK_USABLE,
    CHECK_VIOLATIONS, MEASUREMENTS, WorkingDir,
};

pub const SMALL_COUNT_MISMATCH: &str = "Features: wrong event count abs(diff) < 5";

/// Violations and alerts that are known not to indicate a real problem.
const EXPECTED_PROBLEMS: &[&str] = &[
    // alerts: cannot be guessed
    "Metadata: Missing key [setup] 'flow rate sample'",
    "Metadata: Missing key [setup] 'flow rate sheath'",
    // alerts: only for newer setups
    "Metadata: Missing key [setup] 'identifier'",
    "Metadata: Missing key [setup] 'module composition'",
    // alerts: added during tdms conversion
    "Metadata: Missing key [fluorescence] 'channel count'",
    "Metadata: Missing key [fluorescence] 'samples per event'",
    "Metadata: Missing key [setup] 'temperature', because the 'temp' feature is given",
    // violations: only for newer setups
    "Metadata: Missing key [setup] 'medium'",
    SMALL_COUNT_MISMATCH,
];

static EVENT_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Features: wrong event count: .*\((-?\d+) of (-?\d+)\)")
        .unwrap_or_else(|err| panic!("invalid event count pattern: {err}"))
});

/// `present - expected` for a "wrong event count" violation; negative when
/// a feature is missing events. `None` for any other message.
pub fn event_count_difference(violation: &str) -> Option<i64> {
    let caps = EVENT_COUNT.captures(violation)?;
    let present: i64 = caps[1].parse().ok()?;
    let expected: i64 = caps[2].parse().ok()?;
    Some(present - expected)
}

/// Whether every event count mismatch lies inside the tolerance window.
pub fn event_counts_tolerated<'a>(
    violations: impl IntoIterator<Item = &'a String>,
    policy: &CheckPolicy,
) -> bool {
    violations
        .into_iter()
        .filter_map(|violation| event_count_difference(violation))
        .all(|diff| {
            diff >= policy.count_tolerance_min
                && policy.count_tolerance_max.is_none_or(|max| diff <= max)
        })
}

/// `YYYY-MM-DD`, `YYYYMMDD` and `YYMMDD` spellings of a date.
pub fn date_spellings(date: &str) -> Vec<String> {
    let compact = date.replace('-', "");
    let short = compact.get(2..).unwrap_or_default().to_string();
    vec![date.to_string(), compact, short]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InvalidReason {
    Corrupt { kind: CorruptionKind },
    TooShort { events: usize },
    EventCount,
    /// Failure outside the recognized corruption classes.
    Unexpected { message: String },
}

#[derive(Debug)]
enum EntryOutcome {
    Invalid(InvalidReason),
    Checked { report: CheckReport, date: String },
}

/// Classification of every manifest entry, keyed by message text.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckResults {
    pub alerts: BTreeMap<String, Vec<String>>,
    pub information: BTreeMap<String, Vec<String>>,
    pub invalid: Vec<String>,
    pub usable: Vec<String>,
    pub violations: BTreeMap<String, Vec<String>>,
    pub expected: BTreeMap<String, Vec<String>>,
    /// `(declared date, path)` where the date does not appear in the path.
    pub timefaults: Vec<(String, String)>,
    pub invalid_reasons: BTreeMap<String, InvalidReason>,
}

impl CheckResults {
    fn new() -> Self {
        Self {
            expected: EXPECTED_PROBLEMS
                .iter()
                .map(|key| (key.to_string(), Vec::new()))
                .collect(),
            ..Self::default()
        }
    }

    fn file_entry(
        &mut self,
        line: &str,
        path: &str,
        report: CheckReport,
        date: &str,
        policy: &CheckPolicy,
        sink: &dyn ProgressSink,
    ) {
        for violation in report.violations {
            if let Some(paths) = self.expected.get_mut(&violation) {
                paths.push(path.to_string());
            } else if event_count_difference(&violation)
                .is_some_and(|diff| diff.abs() < policy.small_count_mismatch)
            {
                self.expected
                    .entry(SMALL_COUNT_MISMATCH.to_string())
                    .or_default()
                    .push(path.to_string());
            } else {
                sink.event(ProgressEvent::log(2, format!("{violation}: {path}")));
                self.violations
                    .entry(violation)
                    .or_default()
                    .push(path.to_string());
            }
        }
        for alert in report.alerts {
            if let Some(paths) = self.expected.get_mut(&alert) {
                paths.push(path.to_string());
            } else {
                self.alerts.entry(alert).or_default().push(path.to_string());
            }
        }
        for note in report.info {
            self.information
                .entry(note)
                .or_default()
                .push(path.to_string());
        }
        if !date_spellings(date).iter().any(|spelling| path.contains(spelling.as_str())) {
            self.timefaults.push((date.to_string(), path.to_string()));
        }
        self.usable.push(line.to_string());
    }

    fn mark_invalid(&mut self, path: &str, reason: InvalidReason) {
        self.invalid.push(path.to_string());
        self.invalid_reasons.insert(path.to_string(), reason);
    }

    fn write_reports(&self, working_dir: &WorkingDir) -> Result<(), DepotError> {
        let mut info = String::new();
        for (key, paths) in &self.information {
            let _ = writeln!(info, "[{}x]\t{key}", paths.len());
        }
        store::write_bytes_atomic(&working_dir.file(CHECK_INFO), info.as_bytes())?;

        store::write_bytes_atomic(
            &working_dir.file(CHECK_ALERTS),
            render_grouped(&self.alerts).as_bytes(),
        )?;
        store::write_bytes_atomic(
            &working_dir.file(CHECK_VIOLATIONS),
            render_grouped(&self.violations).as_bytes(),
        )?;

        let mut times = String::new();
        for (date, path) in &self.timefaults {
            let _ = writeln!(times, "[{date}]\t{path}");
        }
        store::write_bytes_atomic(&working_dir.file(CHECK_TIMES), times.as_bytes())?;

        store::write_bytes_atomic(
            &working_dir.file(CHECK_INVALID),
            render_lines(&self.invalid).as_bytes(),
        )?;
        store::write_bytes_atomic(
            &working_dir.file(CHECK_EXPECTED),
            render_grouped(&self.expected).as_bytes(),
        )?;
        // last, marks the stage complete
        store::write_bytes_atomic(
            &working_dir.file(CHECK_USABLE),
            render_lines(&self.usable).as_bytes(),
        )?;
        Ok(())
    }
}

fn render_grouped(groups: &BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::new();
    for (key, paths) in groups {
        let _ = writeln!(out, "[{}x]\t{key}", paths.len());
        for path in paths {
            let _ = writeln!(out, "{path}");
        }
        out.push('\n');
    }
    out
}

fn render_lines(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        let _ = writeln!(out, "{line}");
    }
    out
}

/// Opens one measurement and runs the rule check. The handle is dropped
/// before returning on every path.
fn inspect<O: FormatOracle>(
    oracle: &O,
    path: &Path,
    policy: &CheckPolicy,
) -> Result<EntryOutcome, OracleError> {
    let handle = oracle.open(path)?;
    let events = handle.length();
    if events < policy.min_events {
        return Ok(EntryOutcome::Invalid(InvalidReason::TooShort { events }));
    }
    let report = handle.validate()?;
    let date = handle.date()?;
    Ok(EntryOutcome::Checked { report, date })
}

/// Checks every entry of `measurements.txt` and writes the `check_*.txt`
/// partition files next to it.
pub fn check<O: FormatOracle>(
    measurements: &Path,
    oracle: &O,
    policy: &CheckPolicy,
    sink: &dyn ProgressSink,
) -> Result<CheckResults, DepotError> {
    if measurements.file_name().and_then(|name| name.to_str()) != Some(MEASUREMENTS) {
        return Err(DepotError::InvalidInput(format!(
            "please specify a '{MEASUREMENTS}' file, got {}",
            measurements.display()
        )));
    }
    if !measurements.is_file() {
        return Err(DepotError::NotFound(measurements.to_path_buf()));
    }
    let working_dir = WorkingDir::from_report(measurements)?;
    let content = fs::read_to_string(measurements)
        .map_err(|err| DepotError::InvalidInput(format!("{}: {err}", measurements.display())))?;
    let lines = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();

    let started = Instant::now();
    let mut results = CheckResults::new();
    for (index, line) in lines.iter().enumerate() {
        let entry = ManifestEntry::parse_line(line)?;
        let path = entry.path.display().to_string();
        sink.event(ProgressEvent::progress(format!(
            "Checking {}/{}: {path}",
            index + 1,
            lines.len()
        )));

        match inspect(oracle, &entry.path, policy) {
            Ok(EntryOutcome::Invalid(reason)) => {
                debug!(path = %path, ?reason, "invalid measurement");
                results.mark_invalid(&path, reason);
            }
            Ok(EntryOutcome::Checked { report, date }) => {
                if !event_counts_tolerated(&report.violations, policy) {
                    sink.event(ProgressEvent::log(
                        1,
                        format!("!!! Excluded due to bad event counts: {path}"),
                    ));
                    results.mark_invalid(&path, InvalidReason::EventCount);
                    continue;
                }
                results.file_entry(line, &path, report, &date, policy, sink);
            }
            Err(OracleError::Corrupt { kind, message }) => {
                debug!(path = %path, %kind, %message, "corrupt measurement");
                results.mark_invalid(&path, InvalidReason::Corrupt { kind });
            }
            Err(OracleError::Interrupted) => return Err(DepotError::Interrupted),
            Err(OracleError::Failed(message)) => {
                warn!(path = %path, error = %message, "unexpected problem while checking");
                sink.event(ProgressEvent::log(
                    1,
                    format!("!!! OTHER PROBLEM WITH {path}: {message}"),
                ));
                results.mark_invalid(&path, InvalidReason::Unexpected { message });
            }
        }
    }

    sink.event(
        ProgressEvent::log(2, format!("Checked {} measurements", lines.len()))
            .with_elapsed(started.elapsed()),
    );
    results.write_reports(&working_dir)?;
    info!(
        usable = results.usable.len(),
        invalid = results.invalid.len(),
        "check finished"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_count_difference_parses_violation() {
        assert_eq!(
            event_count_difference("Features: wrong event count: 'image' (190 of 200)"),
            Some(-10)
        );
        assert_eq!(
            event_count_difference("Features: wrong event count: 'contour' (203 of 200)"),
            Some(3)
        );
        assert_eq!(
            event_count_difference("Metadata: Missing key [setup] 'medium'"),
            None
        );
    }

    #[test]
    fn tolerance_window_boundaries() {
        let policy = CheckPolicy::default();
        let at_limit = vec!["Features: wrong event count: 'image' (190 of 200)".to_string()];
        let beyond = vec!["Features: wrong event count: 'image' (189 of 200)".to_string()];
        let surplus = vec!["Features: wrong event count: 'image' (9000 of 200)".to_string()];
        assert!(event_counts_tolerated(&at_limit, &policy));
        assert!(!event_counts_tolerated(&beyond, &policy));
        assert!(event_counts_tolerated(&surplus, &policy));

        let bounded = CheckPolicy {
            count_tolerance_max: Some(0),
            ..CheckPolicy::default()
        };
        assert!(!event_counts_tolerated(&surplus, &bounded));
    }

    #[test]
    fn date_spellings_cover_folder_conventions() {
        assert_eq!(
            date_spellings("2019-08-20"),
            vec!["2019-08-20", "20190820", "190820"]
        );
    }

    #[test]
    fn grouped_report_format() {
        let mut groups = BTreeMap::new();
        groups.insert("b".to_string(), vec!["/p/2".to_string()]);
        groups.insert(
            "a".to_string(),
            vec!["/p/1".to_string(), "/p/3".to_string()],
        );
        assert_eq!(
            render_grouped(&groups),
            "[2x]\ta\n/p/1\n/p/3\n\n[1x]\tb\n/p/2\n\n"
        );
    }
}
