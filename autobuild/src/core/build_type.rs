//! Build-type classification of commits.
//!
//! A build type is a single lower-case letter. Commit subjects starting with a
//! registered marker select that letter; everything else gets the table's
//! default (continuous).

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A commit line starting with this marker asks the CI agent to skip the commit.
pub const IGNORE_MARKER: &str = "AUTOBUILD_IGNORE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BuildType(char);

impl BuildType {
    pub const CONTINUOUS: BuildType = BuildType('c');
    pub const MILESTONE: BuildType = BuildType('m');
    pub const DAILY: BuildType = BuildType('d');
    pub const SNAPSHOT: BuildType = BuildType('s');
    pub const FULL: BuildType = BuildType('f');

    /// Normalizes to lower case; only ASCII letters are valid.
    pub fn new(code: char) -> Result<Self> {
        if !code.is_ascii_alphabetic() {
            return Err(Error::configuration(format!(
                "invalid build type '{code}' (expected a single letter)"
            ))
            .into());
        }
        Ok(Self(code.to_ascii_lowercase()))
    }

    pub fn as_char(self) -> char {
        self.0
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BuildType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(code), None) => Self::new(code),
            _ => Err(Error::configuration(format!(
                "invalid build type '{s}' (expected a single letter)"
            ))
            .into()),
        }
    }
}

impl TryFrom<String> for BuildType {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BuildType> for String {
    fn from(build_type: BuildType) -> Self {
        build_type.0.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTypeEntry {
    pub code: BuildType,
    pub name: String,
    /// Subject prefix selecting this type; `None` for the default entry.
    pub marker: Option<String>,
}

impl BuildTypeEntry {
    pub fn new(code: BuildType, name: &str, marker: Option<&str>) -> Self {
        Self {
            code,
            name: name.to_string(),
            marker: marker.map(str::to_string),
        }
    }
}

/// Marker-to-letter table. Never ambiguous: each letter and each marker
/// appears once and no marker is a prefix of another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTypeTable {
    default: BuildType,
    entries: Vec<BuildTypeEntry>,
}

impl BuildTypeTable {
    pub fn new(default: BuildType, entries: Vec<BuildTypeEntry>) -> Result<Self> {
        let table = Self { default, entries };
        table.validate()?;
        Ok(table)
    }

    /// Continuous by default, plus milestone, daily, snapshot and full markers.
    pub fn standard() -> Self {
        Self {
            default: BuildType::CONTINUOUS,
            entries: vec![
                BuildTypeEntry::new(BuildType::CONTINUOUS, "continuous", None),
                BuildTypeEntry::new(BuildType::MILESTONE, "milestone", Some("[milestone]")),
                BuildTypeEntry::new(BuildType::DAILY, "daily", Some("[daily]")),
                BuildTypeEntry::new(BuildType::SNAPSHOT, "snapshot", Some("[snapshot]")),
                BuildTypeEntry::new(BuildType::FULL, "full", Some("[full]")),
            ],
        }
    }

    /// Add an entry, rejecting anything that would make the table ambiguous.
    pub fn with_entry(mut self, entry: BuildTypeEntry) -> Result<Self> {
        self.entries.push(entry);
        self.validate()?;
        Ok(self)
    }

    pub fn default_type(&self) -> BuildType {
        self.default
    }

    pub fn entries(&self) -> &[BuildTypeEntry] {
        &self.entries
    }

    pub fn name_of(&self, code: BuildType) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.code == code)
            .map(|entry| entry.name.as_str())
    }

    /// Classify a commit message by the marker at the start of its subject line.
    pub fn classify(&self, message: &str) -> BuildType {
        let subject = message.lines().next().unwrap_or("").trim_start().to_lowercase();
        self.entries
            .iter()
            .find(|entry| {
                entry
                    .marker
                    .as_ref()
                    .is_some_and(|marker| subject.starts_with(&marker.to_lowercase()))
            })
            .map_or(self.default, |entry| entry.code)
    }

    fn validate(&self) -> Result<()> {
        let mut markers: Vec<String> = Vec::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if self.entries[..idx].iter().any(|prev| prev.code == entry.code) {
                return Err(ambiguous(format!(
                    "build type '{}' is registered twice",
                    entry.code
                )));
            }
            match &entry.marker {
                Some(marker) if marker.trim().is_empty() => {
                    return Err(ambiguous(format!(
                        "build type '{}' has an empty marker",
                        entry.code
                    )));
                }
                Some(marker) => {
                    let marker = marker.to_lowercase();
                    if let Some(clash) = markers
                        .iter()
                        .find(|other| other.starts_with(&marker) || marker.starts_with(other.as_str()))
                    {
                        return Err(ambiguous(format!(
                            "marker '{marker}' overlaps marker '{clash}'"
                        )));
                    }
                    markers.push(marker);
                }
                None if entry.code != self.default => {
                    return Err(ambiguous(format!(
                        "build type '{}' has no marker and is not the default",
                        entry.code
                    )));
                }
                None => {}
            }
        }
        match self.entries.iter().find(|entry| entry.code == self.default) {
            Some(entry) if entry.marker.is_none() => Ok(()),
            Some(_) => Err(ambiguous(format!(
                "default build type '{}' must not have a marker",
                self.default
            ))),
            None => Err(ambiguous(format!(
                "default build type '{}' is not in the table",
                self.default
            ))),
        }
    }
}

impl Default for BuildTypeTable {
    fn default() -> Self {
        Self::standard()
    }
}

fn ambiguous(message: String) -> anyhow::Error {
    Error::configuration(message).into()
}

/// True if any line of `message` starts with [`IGNORE_MARKER`].
pub fn has_ignore_marker(message: &str) -> bool {
    message
        .lines()
        .any(|line| line.trim_start().starts_with(IGNORE_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_configuration;

    #[test]
    fn standard_table_is_valid() {
        let table = BuildTypeTable::standard();
        BuildTypeTable::new(table.default_type(), table.entries().to_vec()).expect("valid");
    }

    #[test]
    fn unmarked_commit_is_continuous() {
        let table = BuildTypeTable::standard();
        assert_eq!(table.classify("fix typo in README"), BuildType::CONTINUOUS);
        assert_eq!(table.classify(""), BuildType::CONTINUOUS);
    }

    #[test]
    fn marker_must_lead_the_subject() {
        let table = BuildTypeTable::standard();
        assert_eq!(
            table.classify("[Milestone] 1.2 feature freeze\n\nbody"),
            BuildType::MILESTONE
        );
        assert_eq!(
            table.classify("prepare [milestone] later"),
            BuildType::CONTINUOUS
        );
        assert_eq!(
            table.classify("subject\n[milestone] in body"),
            BuildType::CONTINUOUS
        );
    }

    #[test]
    fn duplicate_code_is_rejected() {
        let err = BuildTypeTable::standard()
            .with_entry(BuildTypeEntry::new(BuildType::MILESTONE, "release", Some("[release]")))
            .expect_err("duplicate code");
        assert!(is_configuration(&err));
    }

    #[test]
    fn overlapping_markers_are_rejected() {
        let err = BuildTypeTable::standard()
            .with_entry(BuildTypeEntry::new(
                BuildType::new('x').expect("code"),
                "extended",
                Some("[mile"),
            ))
            .expect_err("prefix overlap");
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn table_is_extensible() {
        let extended = BuildType::new('x').expect("code");
        let table = BuildTypeTable::standard()
            .with_entry(BuildTypeEntry::new(extended, "extended", Some("[extended]")))
            .expect("extend");
        assert_eq!(table.classify("[extended] run everything"), extended);
        assert_eq!(table.name_of(extended), Some("extended"));
    }

    #[test]
    fn build_type_normalizes_case() {
        assert_eq!("C".parse::<BuildType>().expect("parse"), BuildType::CONTINUOUS);
        assert!("cc".parse::<BuildType>().is_err());
        assert!(BuildType::new('1').is_err());
    }

    #[test]
    fn ignore_marker_on_any_line() {
        assert!(has_ignore_marker("docs\n\nAUTOBUILD_IGNORE"));
        assert!(!has_ignore_marker("mention AUTOBUILD_IGNORE mid-line"));
    }
}
