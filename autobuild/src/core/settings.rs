//! Settings store: enumerated keys plus per-(step, build type) switches.
//!
//! A `Settings` value belongs to one build context. It is cloned into each
//! build when the pipeline is planned, so changes made afterwards only affect
//! builds planned later.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::core::build_type::BuildType;
use crate::core::steps::{StepKind, StepPolicy};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettingKey {
    ProjectName,
    ProjectVersion,
    ProjectBuildType,
    ProjectSourceLocation,
    ProjectRevision,
    ProjectBranch,
    ProjectSourceDir,
    ProjectPackagesDir,
    ProjectLogDir,
    ConfigurationBuildDir,
    ConfigurationTargetDir,
    ScriptLogLevel,
    ScriptRunMode,
    ScriptIgnoreCommitMessageCommands,
    CiBuildCap,
}

impl SettingKey {
    pub const ALL: [SettingKey; 15] = [
        SettingKey::ProjectName,
        SettingKey::ProjectVersion,
        SettingKey::ProjectBuildType,
        SettingKey::ProjectSourceLocation,
        SettingKey::ProjectRevision,
        SettingKey::ProjectBranch,
        SettingKey::ProjectSourceDir,
        SettingKey::ProjectPackagesDir,
        SettingKey::ProjectLogDir,
        SettingKey::ConfigurationBuildDir,
        SettingKey::ConfigurationTargetDir,
        SettingKey::ScriptLogLevel,
        SettingKey::ScriptRunMode,
        SettingKey::ScriptIgnoreCommitMessageCommands,
        SettingKey::CiBuildCap,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SettingKey::ProjectName => "project.name",
            SettingKey::ProjectVersion => "project.version",
            SettingKey::ProjectBuildType => "project.buildtype",
            SettingKey::ProjectSourceLocation => "project.sourcelocation",
            SettingKey::ProjectRevision => "project.revision",
            SettingKey::ProjectBranch => "project.branch",
            SettingKey::ProjectSourceDir => "project.srcdir",
            SettingKey::ProjectPackagesDir => "project.packagesdir",
            SettingKey::ProjectLogDir => "project.logdir",
            SettingKey::ConfigurationBuildDir => "configuration.builddir",
            SettingKey::ConfigurationTargetDir => "configuration.targetdir",
            SettingKey::ScriptLogLevel => "script.loglevel",
            SettingKey::ScriptRunMode => "script.runmode",
            SettingKey::ScriptIgnoreCommitMessageCommands => "script.ignorecommitmessagecommands",
            SettingKey::CiBuildCap => "ci.build.cap",
        }
    }

    pub fn default_value(self) -> Option<&'static str> {
        match self {
            SettingKey::ProjectBuildType => Some("c"),
            SettingKey::ProjectSourceDir => Some("src"),
            SettingKey::ProjectPackagesDir => Some("packages"),
            SettingKey::ProjectLogDir => Some("log"),
            SettingKey::ConfigurationBuildDir => Some("build"),
            SettingKey::ConfigurationTargetDir => Some("install"),
            SettingKey::ScriptLogLevel => Some("0"),
            SettingKey::ScriptRunMode => Some("build"),
            SettingKey::ScriptIgnoreCommitMessageCommands => Some("false"),
            SettingKey::CiBuildCap => Some("8"),
            SettingKey::ProjectName
            | SettingKey::ProjectVersion
            | SettingKey::ProjectSourceLocation
            | SettingKey::ProjectRevision
            | SettingKey::ProjectBranch => None,
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SettingKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.name() == s)
            .ok_or_else(|| Error::configuration(format!("unknown setting '{s}'")).into())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<SettingKey, String>,
    step_enabled: BTreeMap<(StepKind, BuildType), bool>,
    best_effort: BTreeMap<StepKind, bool>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, falling back to its default.
    pub fn get(&self, key: SettingKey) -> Result<&str> {
        self.get_optional(key).ok_or_else(|| {
            Error::configuration(format!("setting '{key}' is not defined")).into()
        })
    }

    pub fn get_optional(&self, key: SettingKey) -> Option<&str> {
        self.values
            .get(&key)
            .map(String::as_str)
            .or_else(|| key.default_value())
    }

    pub fn set(&mut self, key: SettingKey, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }

    /// `get` addressed by dotted key name.
    pub fn get_named(&self, name: &str) -> Result<&str> {
        self.get(name.parse()?)
    }

    /// `set` addressed by dotted key name.
    pub fn set_named(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let key: SettingKey = name.parse()?;
        self.set(key, value);
        Ok(())
    }

    pub fn get_parsed<T: FromStr>(&self, key: SettingKey) -> Result<T> {
        let raw = self.get(key)?;
        raw.trim().parse().map_err(|_| {
            Error::configuration(format!("setting '{key}' has invalid value '{raw}'")).into()
        })
    }

    pub fn get_bool(&self, key: SettingKey) -> Result<bool> {
        let raw = self.get(key)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::configuration(format!(
                "setting '{key}' has invalid boolean '{raw}'"
            ))
            .into()),
        }
    }

    pub fn build_type(&self) -> Result<BuildType> {
        self.get(SettingKey::ProjectBuildType)?.parse()
    }

    /// Whether `step_name` runs for `build_type`. Unknown step names are rejected.
    pub fn build_step_enabled(&self, step_name: &str, build_type: char) -> Result<bool> {
        let step = StepKind::parse(step_name)?;
        Ok(self.is_step_enabled(step, BuildType::new(build_type)?))
    }

    /// Enable or disable `step_name` for `build_type`. Unknown step names are rejected.
    pub fn set_build_step_enabled(
        &mut self,
        step_name: &str,
        build_type: char,
        enabled: bool,
    ) -> Result<()> {
        let step = StepKind::parse(step_name)?;
        self.set_step_enabled(step, BuildType::new(build_type)?, enabled);
        Ok(())
    }

    /// Steps are enabled for every build type unless switched off.
    pub fn is_step_enabled(&self, step: StepKind, build_type: BuildType) -> bool {
        self.step_enabled
            .get(&(step, build_type))
            .copied()
            .unwrap_or(true)
    }

    pub fn set_step_enabled(&mut self, step: StepKind, build_type: BuildType, enabled: bool) {
        self.step_enabled.insert((step, build_type), enabled);
    }

    pub fn step_policy(&self, step: StepKind) -> StepPolicy {
        let mut policy = step.default_policy();
        if let Some(best_effort) = self.best_effort.get(&step) {
            policy.best_effort = *best_effort;
        }
        policy
    }

    pub fn set_step_best_effort(&mut self, step_name: &str, best_effort: bool) -> Result<()> {
        let step = StepKind::parse(step_name)?;
        self.best_effort.insert(step, best_effort);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_configuration;

    #[test]
    fn every_key_round_trips() {
        let mut settings = Settings::new();
        for (idx, key) in SettingKey::ALL.into_iter().enumerate() {
            let value = format!("value-{idx} with spaces");
            settings.set(key, value.clone());
            assert_eq!(settings.get(key).expect("get"), value);
            assert_eq!(settings.get_named(key.name()).expect("get named"), value);
        }
    }

    #[test]
    fn unknown_key_is_configuration_error() {
        let mut settings = Settings::new();
        let err = settings.get_named("project.colour").expect_err("unknown");
        assert!(is_configuration(&err));
        assert!(settings.set_named("bogus", "x").is_err());
    }

    #[test]
    fn defaults_apply_and_required_keys_fail() {
        let settings = Settings::new();
        assert_eq!(settings.get(SettingKey::ProjectSourceDir).expect("default"), "src");
        assert_eq!(settings.get_parsed::<u32>(SettingKey::CiBuildCap).expect("cap"), 8);
        assert!(!settings
            .get_bool(SettingKey::ScriptIgnoreCommitMessageCommands)
            .expect("bool"));
        let err = settings.get(SettingKey::ProjectName).expect_err("unset");
        assert!(is_configuration(&err));
    }

    #[test]
    fn steps_default_to_enabled() {
        let settings = Settings::new();
        for step in StepKind::ALL {
            assert!(settings.build_step_enabled(step.name(), 'c').expect("query"));
            assert!(settings.build_step_enabled(step.name(), 'm').expect("query"));
        }
    }

    #[test]
    fn switching_a_step_is_per_build_type() {
        let mut settings = Settings::new();
        settings
            .set_build_step_enabled("project-upload-packages", 'c', false)
            .expect("disable");
        assert!(!settings
            .build_step_enabled("project-upload-packages", 'c')
            .expect("query"));
        assert!(!settings
            .build_step_enabled("project-upload-packages", 'C')
            .expect("query upper"));
        assert!(settings
            .build_step_enabled("project-upload-packages", 'm')
            .expect("query other"));
    }

    #[test]
    fn unknown_step_name_is_rejected() {
        let mut settings = Settings::new();
        let err = settings
            .set_build_step_enabled("unknown-step", 'c', true)
            .expect_err("unknown step");
        assert!(is_configuration(&err));
        assert!(settings.build_step_enabled("project-xyz", 'c').is_err());
        assert!(settings.set_step_best_effort("nope", true).is_err());
    }

    #[test]
    fn best_effort_override() {
        let mut settings = Settings::new();
        assert!(!settings.step_policy(StepKind::ConfTest).best_effort);
        settings.set_step_best_effort("conf-test", true).expect("set");
        assert!(settings.step_policy(StepKind::ConfTest).best_effort);
        assert!(!settings.step_policy(StepKind::ConfTest).runs_after_failure);
    }
}
