//! Read-only queries used by the `query` and `print` commands.

use anyhow::Result;

use crate::core::build_type::BuildType;
use crate::core::revision::RevisionInfo;
use crate::core::settings::Settings;
use crate::error::Error;

/// `key: value` for a setting, or `step.<name>.<type>: enabled|disabled` for a
/// step switch. Unknown keys and step names are configuration errors.
pub fn query_setting(settings: &Settings, key: &str) -> Result<String> {
    if let Some(rest) = key.strip_prefix("step.") {
        let (step, build_type) = rest.rsplit_once('.').ok_or_else(|| {
            Error::configuration(format!(
                "malformed step query '{key}' (expected step.<name>.<build-type>)"
            ))
        })?;
        let build_type: BuildType = build_type.parse()?;
        let enabled = settings.build_step_enabled(step, build_type.as_char())?;
        let state = if enabled { "enabled" } else { "disabled" };
        return Ok(format!("{key}: {state}"));
    }
    Ok(format!("{key}: {}", settings.get_named(key)?))
}

/// `<id> <build-type> <subject>`.
pub fn format_revision(info: &RevisionInfo) -> String {
    format!(
        "{} {} {}",
        info.revision(),
        info.build_type(),
        info.subject()
    )
}
