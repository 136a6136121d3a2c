//! Project, environments and configurations.
//!
//! A project is assembled during setup (usually from the build file) and then
//! frozen. Once frozen, nothing can be added; builds only read it.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::core::build_type::BuildTypeTable;
use crate::core::descriptor::ScmDescriptor;
use crate::core::environment::{Environment, HostToolchains, Mismatch};
use crate::core::settings::{SettingKey, Settings};
use crate::error::Error;
use crate::plugin::Plugin;

/// Directories of one build scope.
///
/// Sources, packages and logs are shared by the whole project; each
/// configuration gets its own build and target directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDirs {
    /// Working directory of the scope: the project base or `<base>/<configuration>`.
    pub base: PathBuf,
    pub source: PathBuf,
    pub build: PathBuf,
    pub target: PathBuf,
    pub packages: PathBuf,
    pub log: PathBuf,
}

impl BuildDirs {
    /// `<base>/{src,packages,log}` with names taken from `settings`. The
    /// project scope builds and installs in `base` itself.
    pub fn project(base: &Path, settings: &Settings) -> Result<Self> {
        Ok(Self {
            source: base.join(settings.get(SettingKey::ProjectSourceDir)?),
            build: base.to_path_buf(),
            target: base.to_path_buf(),
            packages: base.join(settings.get(SettingKey::ProjectPackagesDir)?),
            log: base.join(settings.get(SettingKey::ProjectLogDir)?),
            base: base.to_path_buf(),
        })
    }

    /// `<base>/<configuration>/{build,install}` next to the project's shared
    /// directories.
    pub fn configuration(
        project: &BuildDirs,
        configuration: &str,
        settings: &Settings,
    ) -> Result<Self> {
        let base = project.base.join(configuration);
        Ok(Self {
            source: project.source.clone(),
            build: base.join(settings.get(SettingKey::ConfigurationBuildDir)?),
            target: base.join(settings.get(SettingKey::ConfigurationTargetDir)?),
            packages: project.packages.clone(),
            log: project.log.clone(),
            base,
        })
    }

    pub fn all(&self) -> [&Path; 6] {
        [
            &self.base,
            &self.source,
            &self.build,
            &self.target,
            &self.packages,
            &self.log,
        ]
    }
}

/// A named build variant bound to one environment.
pub struct Configuration {
    name: String,
    environment: String,
    plugins: Vec<Box<dyn Plugin>>,
    frozen: bool,
}

impl Configuration {
    pub fn new(name: &str, environment: &str) -> Self {
        Self {
            name: name.to_string(),
            environment: environment.to_string(),
            plugins: Vec::new(),
            frozen: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn plugins(&self) -> impl Iterator<Item = &dyn Plugin> {
        self.plugins.iter().map(|plugin| plugin.as_ref())
    }

    pub fn add_plugin(&mut self, plugin: Box<dyn Plugin>) -> Result<()> {
        if self.frozen {
            return Err(Error::configuration(format!(
                "configuration '{}' is frozen; cannot add plugin '{}'",
                self.name,
                plugin.name()
            ))
            .into());
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

pub struct Project {
    name: String,
    version: Option<String>,
    scm: ScmDescriptor,
    branch: Option<String>,
    settings: Settings,
    build_types: BuildTypeTable,
    environments: Vec<Environment>,
    configurations: Vec<Configuration>,
    plugins: Vec<Box<dyn Plugin>>,
    frozen: bool,
}

impl Project {
    /// Fails with a configuration error if `scm` is not a valid descriptor.
    pub fn new(name: &str, scm: &str) -> Result<Self> {
        let scm = ScmDescriptor::parse(scm)?;
        let mut settings = Settings::new();
        settings.set(SettingKey::ProjectName, name);
        settings.set(SettingKey::ProjectSourceLocation, scm.to_string());
        Ok(Self {
            name: name.to_string(),
            version: None,
            scm,
            branch: None,
            settings,
            build_types: BuildTypeTable::standard(),
            environments: Vec::new(),
            configurations: Vec::new(),
            plugins: Vec::new(),
            frozen: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn scm(&self) -> &ScmDescriptor {
        &self.scm
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn build_types(&self) -> &BuildTypeTable {
        &self.build_types
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    /// Project-wide plugins (source provider, publishers), in attach order.
    pub fn plugins(&self) -> impl Iterator<Item = &dyn Plugin> {
        self.plugins.iter().map(|plugin| plugin.as_ref())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_version(&mut self, version: &str) -> Result<()> {
        self.ensure_mutable()?;
        self.version = Some(version.to_string());
        self.settings.set(SettingKey::ProjectVersion, version);
        Ok(())
    }

    pub fn set_branch(&mut self, branch: &str) -> Result<()> {
        self.ensure_mutable()?;
        self.branch = Some(branch.to_string());
        self.settings.set(SettingKey::ProjectBranch, branch);
        Ok(())
    }

    pub fn set_build_types(&mut self, table: BuildTypeTable) -> Result<()> {
        self.ensure_mutable()?;
        self.build_types = table;
        Ok(())
    }

    pub fn settings_mut(&mut self) -> Result<&mut Settings> {
        self.ensure_mutable()?;
        Ok(&mut self.settings)
    }

    pub fn add_environment(&mut self, environment: Environment) -> Result<()> {
        self.ensure_mutable()?;
        if self.environment(environment.name()).is_some() {
            return Err(Error::configuration(format!(
                "environment '{}' is defined twice",
                environment.name()
            ))
            .into());
        }
        self.environments.push(environment);
        Ok(())
    }

    /// The configuration's environment must already be registered.
    pub fn add_configuration(&mut self, configuration: Configuration) -> Result<()> {
        self.ensure_mutable()?;
        if self.environment(configuration.environment()).is_none() {
            return Err(Error::configuration(format!(
                "configuration '{}' refers to unknown environment '{}'",
                configuration.name(),
                configuration.environment()
            ))
            .into());
        }
        if self.configuration(configuration.name()).is_some() {
            return Err(Error::configuration(format!(
                "configuration '{}' is defined twice",
                configuration.name()
            ))
            .into());
        }
        self.configurations.push(configuration);
        Ok(())
    }

    pub fn configuration_mut(&mut self, name: &str) -> Result<&mut Configuration> {
        self.ensure_mutable()?;
        self.configurations
            .iter_mut()
            .find(|configuration| configuration.name == name)
            .ok_or_else(|| Error::configuration(format!("unknown configuration '{name}'")).into())
    }

    pub fn add_plugin(&mut self, plugin: Box<dyn Plugin>) -> Result<()> {
        self.ensure_mutable()?;
        self.plugins.push(plugin);
        Ok(())
    }

    /// End setup. Freezes every configuration as well.
    pub fn freeze(&mut self) {
        for configuration in &mut self.configurations {
            configuration.frozen = true;
        }
        self.frozen = true;
    }

    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|env| env.name() == name)
    }

    pub fn configuration(&self, name: &str) -> Option<&Configuration> {
        self.configurations.iter().find(|c| c.name == name)
    }

    /// Environment mismatches for `configuration` on `host`; empty means runnable.
    pub fn runnable_mismatches(
        &self,
        configuration: &Configuration,
        host: &HostToolchains,
    ) -> Result<Vec<Mismatch>> {
        let environment = self.environment(configuration.environment()).ok_or_else(|| {
            Error::configuration(format!(
                "configuration '{}' refers to unknown environment '{}'",
                configuration.name(),
                configuration.environment()
            ))
        })?;
        Ok(environment.mismatches(host))
    }

    /// Every tool named by any environment requirement.
    pub fn required_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = self
            .environments
            .iter()
            .flat_map(|env| env.required_tools().map(str::to_string))
            .collect();
        tools.sort();
        tools.dedup();
        tools
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(Error::configuration(format!(
                "project '{}' setup is finished; it can no longer be changed",
                self.name
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_configuration;
    use crate::test_support::StaticPlugin;

    fn project() -> Project {
        let mut project = Project::new("hello", "git:/srv/hello").expect("project");
        project
            .add_environment(Environment::new("default"))
            .expect("env");
        project
    }

    #[test]
    fn malformed_descriptor_fails_setup() {
        let err = Project::new("hello", "cvs:/srv/hello").err().expect("bad scm");
        assert!(is_configuration(&err));
    }

    #[test]
    fn configuration_needs_known_environment() {
        let mut project = project();
        let err = project
            .add_configuration(Configuration::new("release", "msvc"))
            .expect_err("unknown env");
        assert!(is_configuration(&err));
        project
            .add_configuration(Configuration::new("release", "default"))
            .expect("known env");
        assert!(project
            .add_configuration(Configuration::new("release", "default"))
            .is_err());
    }

    #[test]
    fn frozen_project_rejects_changes() {
        let mut project = project();
        project
            .add_configuration(Configuration::new("debug", "default"))
            .expect("config");
        project.freeze();
        assert!(project.configurations()[0].is_frozen());
        assert!(project.add_plugin(Box::new(StaticPlugin::new("late"))).is_err());
        assert!(project.configuration_mut("debug").is_err());
        assert!(project.set_version("2.0").is_err());
    }

    #[test]
    fn frozen_configuration_rejects_plugins() {
        let mut configuration = Configuration::new("debug", "default");
        configuration
            .add_plugin(Box::new(StaticPlugin::new("make")))
            .expect("add");
        configuration.frozen = true;
        let err = configuration
            .add_plugin(Box::new(StaticPlugin::new("late")))
            .expect_err("frozen");
        assert!(is_configuration(&err));
    }

    #[test]
    fn build_dirs_follow_settings() {
        let mut settings = Settings::new();
        settings.set(SettingKey::ProjectPackagesDir, "dist");
        let project = BuildDirs::project(Path::new("/work"), &settings).expect("project dirs");
        assert_eq!(project.source, Path::new("/work/src"));
        assert_eq!(project.packages, Path::new("/work/dist"));
        assert_eq!(project.build, Path::new("/work"));

        let dirs = BuildDirs::configuration(&project, "release", &settings).expect("dirs");
        assert_eq!(dirs.base, Path::new("/work/release"));
        assert_eq!(dirs.source, Path::new("/work/src"));
        assert_eq!(dirs.packages, Path::new("/work/dist"));
        assert_eq!(dirs.build, Path::new("/work/release/build"));
        assert_eq!(dirs.target, Path::new("/work/release/install"));
    }

    #[test]
    fn settings_are_seeded_from_project() {
        let mut project = project();
        project.set_version("1.4").expect("version");
        assert_eq!(project.settings().get(SettingKey::ProjectName).expect("name"), "hello");
        assert_eq!(project.settings().get(SettingKey::ProjectVersion).expect("version"), "1.4");
        assert_eq!(
            project
                .settings()
                .get(SettingKey::ProjectSourceLocation)
                .expect("scm"),
            "git:/srv/hello"
        );
    }
}
