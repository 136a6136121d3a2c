//! Git revision engine.
//!
//! History queries run against a bare mirror kept under the engine's cache
//! directory, so polling never touches a working tree. A small, explicit
//! wrapper around `git` subprocess calls does the work.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::core::build_type::BuildTypeTable;
use crate::core::descriptor::ScmKind;
use crate::core::revision::{CommitFields, RevisionInfo};
use crate::error::Error;
use crate::io::scm::{EngineOptions, RetryPolicy, RevisionEngine};

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';
/// hash, short hash, committer name, committer email, commit time, raw body.
const LOG_FORMAT: &str = "--format=%H%x1f%h%x1f%cn%x1f%ce%x1f%ct%x1f%B%x1e";

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Create a repository with a default branch of `main`.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.workdir)
            .with_context(|| format!("create directory {}", self.workdir.display()))?;
        self.run_checked(&["init", "--quiet", "--initial-branch=main"])?;
        Ok(())
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.run_checked(&["config", key, value])?;
        Ok(())
    }

    /// Return the current HEAD SHA.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit whatever is staged, allowing empty commits.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> Result<String> {
        debug!("committing");
        self.run_checked(&["commit", "--quiet", "--allow-empty", "-m", message])?;
        self.head_sha()
    }

    /// True if `revision` names a commit in this repository.
    pub fn commit_exists(&self, revision: &str) -> Result<bool> {
        let spec = format!("{revision}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.status.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Revision engine backed by a bare mirror of `location`.
#[derive(Debug, Clone)]
pub struct GitEngine {
    location: String,
    mirror: PathBuf,
    branch: Option<String>,
    build_types: BuildTypeTable,
    retry: RetryPolicy,
}

impl GitEngine {
    pub fn new(location: &str, options: EngineOptions) -> Self {
        let location = local_absolute(location);
        let mirror = options
            .cache_dir
            .join("git")
            .join(mirror_dir_name(&location));
        let mirror = std::path::absolute(&mirror).unwrap_or(mirror);
        Self {
            location,
            mirror,
            branch: options.branch,
            build_types: options.build_types,
            retry: options.retry,
        }
    }

    pub fn mirror_path(&self) -> &Path {
        &self.mirror
    }

    /// Clone the mirror on first use, refresh it afterwards.
    #[instrument(skip_all, fields(location = %self.location))]
    pub fn sync(&self) -> Result<()> {
        self.retry.run("git sync", || {
            if self.mirror.join("HEAD").is_file() {
                debug!("refreshing mirror");
                Git::new(&self.mirror)
                    .run_checked(&["remote", "update", "--prune"])
                    .map_err(|err| Error::transport(format!("{err:#}")))?;
            } else {
                info!(mirror = %self.mirror.display(), "cloning mirror");
                let parent = self
                    .mirror
                    .parent()
                    .ok_or_else(|| anyhow!("mirror path has no parent"))?;
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
                if self.mirror.exists() {
                    fs::remove_dir_all(&self.mirror).with_context(|| {
                        format!("remove partial mirror {}", self.mirror.display())
                    })?;
                }
                let mirror = self.mirror.to_string_lossy().into_owned();
                Git::new(parent)
                    .run_checked(&["clone", "--quiet", "--mirror", &self.location, &mirror])
                    .map_err(|err| Error::transport(format!("{err:#}")))?;
            }
            Ok(())
        })
    }

    fn head_ref(&self) -> &str {
        self.branch.as_deref().unwrap_or("HEAD")
    }

    fn log(&self, args: &[&str]) -> Result<Vec<RevisionInfo>> {
        let mut full = vec!["log", "--topo-order", LOG_FORMAT];
        full.extend_from_slice(args);
        let out = Git::new(&self.mirror)
            .run_capture(&full)
            .map_err(|err| Error::build(format!("{err:#}")))?;
        parse_log(&out, &self.build_types)
    }
}

impl RevisionEngine for GitEngine {
    fn kind(&self) -> ScmKind {
        ScmKind::Git
    }

    fn current_revision(&self) -> Result<RevisionInfo> {
        self.sync()?;
        let head = self.head_ref().to_string();
        self.log(&["-n", "1", &head])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::build(format!("{} has no commits", self.location)).into())
    }

    #[instrument(skip_all, fields(since = revision, count))]
    fn revisions_since(&self, revision: &str, count: Option<usize>) -> Result<Vec<RevisionInfo>> {
        self.sync()?;
        if revision.starts_with('-') || !Git::new(&self.mirror).commit_exists(revision)? {
            return Err(Error::build(format!(
                "unknown revision '{revision}' in {}",
                self.location
            ))
            .into());
        }
        let range = format!("{revision}..{}", self.head_ref());
        let mut revisions = self.log(&["--reverse", &range])?;
        if let Some(count) = count {
            revisions.truncate(count);
        }
        debug!(found = revisions.len(), "revisions since");
        Ok(revisions)
    }
}

/// Parse `git log` output produced with [`LOG_FORMAT`].
pub fn parse_log(output: &str, build_types: &BuildTypeTable) -> Result<Vec<RevisionInfo>> {
    let mut revisions = Vec::new();
    for record in output.split(RECORD_SEP) {
        let record = record.trim_start_matches(['\n', '\r']);
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(6, FIELD_SEP).collect();
        let [revision, short_revision, committer, email, timestamp, message] = fields[..] else {
            return Err(anyhow!("malformed git log record: {record:?}"));
        };
        let seconds: i64 = timestamp
            .trim()
            .parse()
            .with_context(|| format!("parse commit time '{timestamp}'"))?;
        let timestamp: DateTime<Utc> = DateTime::from_timestamp(seconds, 0)
            .ok_or_else(|| anyhow!("commit time out of range: {seconds}"))?;
        let message = message.trim_end().to_string();
        let build_type = build_types.classify(&message);
        revisions.push(RevisionInfo::new(
            CommitFields {
                revision: revision.to_string(),
                short_revision: short_revision.to_string(),
                committer: committer.to_string(),
                committer_email: (!email.is_empty()).then(|| email.to_string()),
                message,
                timestamp,
            },
            build_type,
        ));
    }
    Ok(revisions)
}

fn local_absolute(location: &str) -> String {
    let path = Path::new(location);
    if path.is_relative() && path.exists() {
        if let Ok(abs) = std::path::absolute(path) {
            return abs.to_string_lossy().into_owned();
        }
    }
    location.to_string()
}

fn mirror_dir_name(location: &str) -> String {
    let name: String = location
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{}.git", name.trim_matches('_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::build_type::BuildType;
    use crate::error::{classify, is_transport};
    use crate::test_support::TestRepo;

    fn engine_for_repo(repo: &TestRepo, cache: &Path) -> GitEngine {
        let mut options = EngineOptions::new(cache);
        options.retry = RetryPolicy::none();
        GitEngine::new(&repo.path().display().to_string(), options)
    }

    #[test]
    fn parses_log_records() {
        let output = "abc123\u{1f}abc\u{1f}Ada\u{1f}ada@example.org\u{1f}1700000000\u{1f}[milestone] cut 1.0\n\nbody\n\u{1e}\ndef456\u{1f}def\u{1f}Bob\u{1f}\u{1f}1700000100\u{1f}fix\n\u{1e}\n";
        let revisions = parse_log(output, &BuildTypeTable::standard()).expect("parse");
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[0].revision(), "abc123");
        assert_eq!(revisions[0].committer_email(), Some("ada@example.org"));
        assert_eq!(revisions[0].build_type(), BuildType::MILESTONE);
        assert_eq!(revisions[0].message(), "[milestone] cut 1.0\n\nbody");
        assert_eq!(revisions[0].timestamp().timestamp(), 1_700_000_000);
        assert_eq!(revisions[1].committer_email(), None);
        assert_eq!(revisions[1].build_type(), BuildType::CONTINUOUS);
    }

    #[test]
    fn malformed_record_is_rejected() {
        assert!(parse_log("abc\u{1f}def\u{1e}", &BuildTypeTable::standard()).is_err());
    }

    #[test]
    fn mirror_names_are_filesystem_safe() {
        assert_eq!(
            mirror_dir_name("https://example.org/team/hello.git"),
            "https___example_org_team_hello_git.git"
        );
    }

    #[test]
    fn mirror_path_is_absolute_for_relative_cache() {
        let engine = GitEngine::new(
            "https://example.org/hello.git",
            EngineOptions::new(".autobuild/cache"),
        );
        assert!(engine.mirror_path().is_absolute());
        assert!(engine.mirror_path().ends_with("git/https___example_org_hello_git.git"));
    }

    #[test]
    fn revisions_since_are_oldest_first_and_prefix_consistent() {
        let repo = TestRepo::new().expect("repo");
        let c0 = repo.commit("initial").expect("c0");
        let c1 = repo.commit("first change").expect("c1");
        let c2 = repo.commit("[milestone] second change").expect("c2");
        let c3 = repo.commit("third change").expect("c3");
        let cache = tempfile::tempdir().expect("cache");
        let engine = engine_for_repo(&repo, cache.path());

        let all = engine.revisions_since(&c0, None).expect("since c0");
        let ids: Vec<&str> = all.iter().map(RevisionInfo::revision).collect();
        assert_eq!(ids, vec![c1.as_str(), c2.as_str(), c3.as_str()]);
        assert_eq!(all[1].build_type(), BuildType::MILESTONE);

        let first = engine.revisions_since(&c0, Some(1)).expect("since c0, one");
        assert_eq!(first, vec![all[0].clone()]);

        assert!(engine.revisions_since(&c3, None).expect("since head").is_empty());
        assert_eq!(engine.current_revision().expect("head").revision(), c3);
    }

    #[test]
    fn new_commits_are_seen_after_sync() {
        let repo = TestRepo::new().expect("repo");
        let c0 = repo.commit("initial").expect("c0");
        let cache = tempfile::tempdir().expect("cache");
        let engine = engine_for_repo(&repo, cache.path());
        assert!(engine.revisions_since(&c0, None).expect("empty").is_empty());

        let c1 = repo.commit("later").expect("c1");
        let found = engine.revisions_since(&c0, None).expect("since c0");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].revision(), c1);
    }

    #[test]
    fn unknown_revision_is_a_build_error() {
        let repo = TestRepo::new().expect("repo");
        repo.commit("initial").expect("c0");
        let cache = tempfile::tempdir().expect("cache");
        let engine = engine_for_repo(&repo, cache.path());
        let err = engine
            .revisions_since("0123456789abcdef0123456789abcdef01234567", None)
            .expect_err("unknown");
        assert!(matches!(classify(&err), Some(Error::Build(_))));
    }

    #[test]
    fn unreachable_location_fails_after_retries() {
        let cache = tempfile::tempdir().expect("cache");
        let mut options = EngineOptions::new(cache.path());
        options.retry = RetryPolicy::none();
        let engine = GitEngine::new("/nonexistent/autobuild/repo", options);
        let err = engine.current_revision().expect_err("unreachable");
        assert!(!is_transport(&err));
        assert!(matches!(classify(&err), Some(Error::Build(_))));
    }
}
