//! The fixed step table every pipeline is built from.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Named pipeline phase. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StepKind {
    ScmCheckout,
    ConfConfigure,
    ConfMake,
    ConfMakeInstall,
    ConfTest,
    ConfPackage,
    ProjectUploadPackages,
    ProjectCleanup,
}

/// How a step reacts to failures, its own and earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    /// A failing action ends this step but not the build.
    pub best_effort: bool,
    /// The step still executes after an earlier step failed the build.
    pub runs_after_failure: bool,
}

impl StepKind {
    pub const ALL: [StepKind; 8] = [
        StepKind::ScmCheckout,
        StepKind::ConfConfigure,
        StepKind::ConfMake,
        StepKind::ConfMakeInstall,
        StepKind::ConfTest,
        StepKind::ConfPackage,
        StepKind::ProjectUploadPackages,
        StepKind::ProjectCleanup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StepKind::ScmCheckout => "scm-checkout",
            StepKind::ConfConfigure => "conf-configure",
            StepKind::ConfMake => "conf-make",
            StepKind::ConfMakeInstall => "conf-make-install",
            StepKind::ConfTest => "conf-test",
            StepKind::ConfPackage => "conf-package",
            StepKind::ProjectUploadPackages => "project-upload-packages",
            StepKind::ProjectCleanup => "project-cleanup",
        }
    }

    /// Validate a step name against the table.
    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|step| step.name() == name)
            .ok_or_else(|| {
                let legal: Vec<&str> = Self::ALL.iter().map(|step| step.name()).collect();
                Error::configuration(format!(
                    "unknown build step '{name}' (expected one of: {})",
                    legal.join(", ")
                ))
                .into()
            })
    }

    pub fn default_policy(self) -> StepPolicy {
        match self {
            StepKind::ProjectCleanup => StepPolicy {
                best_effort: true,
                runs_after_failure: true,
            },
            _ => StepPolicy {
                best_effort: false,
                runs_after_failure: false,
            },
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StepKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StepKind {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<StepKind> for String {
    fn from(step: StepKind) -> Self {
        step.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_configuration;

    #[test]
    fn names_round_trip_through_parse() {
        for step in StepKind::ALL {
            assert_eq!(StepKind::parse(step.name()).expect("parse"), step);
        }
    }

    #[test]
    fn table_order_matches_ord() {
        let mut sorted = StepKind::ALL;
        sorted.sort();
        assert_eq!(sorted, StepKind::ALL);
        assert!(StepKind::ConfMakeInstall < StepKind::ConfPackage);
    }

    #[test]
    fn unknown_step_is_configuration_error() {
        let err = StepKind::parse("project-xyz").expect_err("unknown");
        assert!(is_configuration(&err));
        assert!(err.to_string().contains("project-xyz"));
    }

    #[test]
    fn only_cleanup_is_best_effort_by_default() {
        let best_effort: Vec<StepKind> = StepKind::ALL
            .into_iter()
            .filter(|step| step.default_policy().best_effort)
            .collect();
        assert_eq!(best_effort, vec![StepKind::ProjectCleanup]);
    }
}
