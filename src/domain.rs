use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DepotError;

/// On-disk flavour of a raw measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementFormat {
    /// Single-file `.rtdc` container.
    Rtdc,
    /// Legacy multi-file `M<n>_data.tdms` measurement.
    Tdms,
}

impl fmt::Display for MeasurementFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementFormat::Rtdc => write!(f, "rtdc"),
            MeasurementFormat::Tdms => write!(f, "tdms"),
        }
    }
}

impl FromStr for MeasurementFormat {
    type Err = DepotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "rtdc" => Ok(MeasurementFormat::Rtdc),
            "tdms" => Ok(MeasurementFormat::Tdms),
            other => Err(DepotError::InvalidInput(format!(
                "unknown measurement format: {other}"
            ))),
        }
    }
}

/// Classification bucket of a single file found by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileClass {
    Measurement(MeasurementFormat),
    /// Belongs to a legacy measurement that is already counted.
    Companion,
    Ancillary,
    Unknown,
}

/// Artifacts that are synchronized per catalog resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Resource,
    Condensed,
    Preview,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Resource,
        ArtifactKind::Condensed,
        ArtifactKind::Preview,
    ];

    pub fn key_prefix(self) -> &'static str {
        match self {
            ArtifactKind::Resource => "resource",
            ArtifactKind::Condensed => "condensed",
            ArtifactKind::Preview => "preview",
        }
    }

    /// Suffix appended to the resource path on local block storage.
    pub fn local_suffix(self) -> &'static str {
        match self {
            ArtifactKind::Resource => "",
            ArtifactKind::Condensed => "_condensed.rtdc",
            ArtifactKind::Preview => "_preview.jpg",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn for_dataset(private: bool) -> Self {
        if private {
            Visibility::Private
        } else {
            Visibility::Public
        }
    }

    /// Object tags that mark an object as publicly readable.
    pub fn tags(self) -> Vec<(String, String)> {
        match self {
            Visibility::Public => vec![("public".to_string(), "true".to_string())],
            Visibility::Private => Vec::new(),
        }
    }
}

/// Catalog identifier of a resource (UUID-shaped).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ResourceId(String);

impl ResourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `abc/def/ghij...`, the sharded form used for storage paths and object keys.
    pub fn sharded(&self) -> String {
        format!("{}/{}/{}", &self.0[..3], &self.0[3..6], &self.0[6..])
    }

    pub fn object_key(&self, kind: ArtifactKind) -> String {
        format!("{}/{}", kind.key_prefix(), self.sharded())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl TryFrom<String> for ResourceId {
    type Error = DepotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for ResourceId {
    type Err = DepotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = normalized.len() >= 7
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_hexdigit() || ch == '-');
        if !is_valid {
            return Err(DepotError::InvalidInput(format!(
                "invalid resource id: {value}"
            )));
        }
        Ok(Self(normalized))
    }
}

/// Common prefix of every file in a depot resource set,
/// e.g. `2019-08-20_1126_c083de`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DepotStem {
    date: NaiveDate,
    time: String,
    shortid: String,
}

impl DepotStem {
    /// `time` accepts `HH:MM`, `HH:MM:SS` or `HHMM`.
    pub fn new(date: &str, time: &str, shortid: &str) -> Result<Self, DepotError> {
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
            .map_err(|_| DepotError::InvalidInput(format!("invalid measurement date: {date}")))?;
        if !(1000..=9999).contains(&date.year()) {
            return Err(DepotError::InvalidInput(format!(
                "measurement year out of range: {date}"
            )));
        }
        let digits: String = time.chars().filter(|ch| ch.is_ascii_digit()).collect();
        if digits.len() < 4 {
            return Err(DepotError::InvalidInput(format!(
                "invalid measurement time: {time}"
            )));
        }
        let shortid = shortid.trim().to_lowercase();
        if shortid.len() != 6 || !shortid.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(DepotError::InvalidInput(format!("invalid short id: {shortid}")));
        }
        Ok(Self {
            date,
            time: digits[..4].to_string(),
            shortid,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Relative depot directory, e.g. `201X/2019-08/20`.
    pub fn depot_subdir(&self) -> String {
        format!(
            "{}X/{}/{:02}",
            self.date.year() / 10,
            self.date.format("%Y-%m"),
            self.date.day()
        )
    }

    pub fn sha256sums_name(&self) -> String {
        format!("{self}.sha256sums")
    }

    pub fn primary_name(&self, version: u32) -> String {
        format!("{self}_v{version}.rtdc")
    }

    pub fn condensed_name(&self, version: u32) -> String {
        format!("{self}_v{version}_condensed.rtdc")
    }

    pub fn ancillary_name(&self, index: u32, measurement: u32) -> String {
        format!("{self}_ad{index}_m{measurement:03}_bg.png")
    }
}

impl fmt::Display for DepotStem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.date.format("%Y-%m-%d"),
            self.time,
            self.shortid
        )
    }
}

impl FromStr for DepotStem {
    type Err = DepotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.trim().splitn(3, '_').collect::<Vec<_>>();
        match parts.as_slice() {
            [date, time, shortid] if time.len() == 4 => Self::new(date, time, shortid),
            _ => Err(DepotError::InvalidInput(format!("invalid depot stem: {value}"))),
        }
    }
}

static DEPOT_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2}_\d{4}_[0-9a-f]{6})(?:(\.sha256sums)|_v(\d+)(_condensed)?\.rtdc|_ad(\d+)_m(\d{3})_bg\.png)$",
    )
    .unwrap_or_else(|err| panic!("invalid depot file pattern: {err}"))
});

/// Role of a file inside a depot resource set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepotFile {
    Sha256Sums,
    Primary { version: u32 },
    Condensed { version: u32 },
    Ancillary { index: u32, measurement: u32 },
}

impl DepotFile {
    /// Splits a canonical depot file name into its stem and role.
    pub fn parse(name: &str) -> Option<(DepotStem, DepotFile)> {
        let caps = DEPOT_FILE.captures(name)?;
        let stem = caps.get(1)?.as_str().parse::<DepotStem>().ok()?;
        let file = if caps.get(2).is_some() {
            DepotFile::Sha256Sums
        } else if let Some(version) = caps.get(3) {
            let version = version.as_str().parse().ok()?;
            if caps.get(4).is_some() {
                DepotFile::Condensed { version }
            } else {
                DepotFile::Primary { version }
            }
        } else {
            DepotFile::Ancillary {
                index: caps.get(5)?.as_str().parse().ok()?,
                measurement: caps.get(6)?.as_str().parse().ok()?,
            }
        };
        Some((stem, file))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn stem_formats_canonical_names() {
        let stem = DepotStem::new("2019-08-20", "11:26:03", "C083DE").unwrap();
        assert_eq!(stem.to_string(), "2019-08-20_1126_c083de");
        assert_eq!(stem.depot_subdir(), "201X/2019-08/20");
        assert_eq!(stem.primary_name(2), "2019-08-20_1126_c083de_v2.rtdc");
        assert_eq!(
            stem.condensed_name(1),
            "2019-08-20_1126_c083de_v1_condensed.rtdc"
        );
        assert_eq!(
            stem.ancillary_name(1, 7),
            "2019-08-20_1126_c083de_ad1_m007_bg.png"
        );
    }

    #[test]
    fn stem_rejects_bad_date() {
        let err = DepotStem::new("20.08.2019", "1126", "c083de").unwrap_err();
        assert_matches!(err, DepotError::InvalidInput(_));
    }

    #[test]
    fn stem_rejects_years_without_four_digits() {
        assert_matches!(
            DepotStem::new("0099-01-01", "1126", "c083de"),
            Err(DepotError::InvalidInput(message)) if message.contains("year")
        );
        let stem = DepotStem::new("1000-01-05", "1126", "c083de").unwrap();
        assert_eq!(stem.depot_subdir(), "100X/1000-01/05");
    }

    #[test]
    fn parse_depot_file_names() {
        let (stem, file) = DepotFile::parse("2019-08-20_1126_c083de_v3_condensed.rtdc").unwrap();
        assert_eq!(stem.to_string(), "2019-08-20_1126_c083de");
        assert_eq!(file, DepotFile::Condensed { version: 3 });

        let (_, file) = DepotFile::parse("2019-08-20_1126_c083de.sha256sums").unwrap();
        assert_eq!(file, DepotFile::Sha256Sums);

        let (_, file) = DepotFile::parse("2019-08-20_1126_c083de_ad2_m002_bg.png").unwrap();
        assert_eq!(
            file,
            DepotFile::Ancillary {
                index: 2,
                measurement: 2
            }
        );

        assert!(DepotFile::parse("M1_data.tdms").is_none());
    }

    #[test]
    fn resource_id_sharding() {
        let id: ResourceId = "0ab1c2d3-aaaa-bbbb-cccc-1234567890ab".parse().unwrap();
        assert_eq!(id.sharded(), "0ab/1c2/d3-aaaa-bbbb-cccc-1234567890ab");
        assert_eq!(
            id.object_key(ArtifactKind::Condensed),
            "condensed/0ab/1c2/d3-aaaa-bbbb-cccc-1234567890ab"
        );
    }
}
