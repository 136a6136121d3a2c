//! Subversion revision engine, driven through `svn log --xml`.

use std::time::Duration;

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::build_type::BuildTypeTable;
use crate::core::descriptor::ScmKind;
use crate::core::revision::{CommitFields, RevisionInfo};
use crate::error::{Error, is_timeout};
use crate::io::process::CommandRunner;
use crate::io::scm::{EngineOptions, RetryPolicy, RevisionEngine};

const SVN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct SvnEngine {
    url: String,
    build_types: BuildTypeTable,
    retry: RetryPolicy,
}

impl SvnEngine {
    pub fn new(url: &str, options: EngineOptions) -> Self {
        Self {
            url: url.to_string(),
            build_types: options.build_types,
            retry: options.retry,
        }
    }

    fn xml_log(&self, args: &[&str]) -> Result<String> {
        self.retry.run("svn log", || {
            let runner = CommandRunner::new("svn")
                .args(["--non-interactive", "log", "--xml"])
                .args(args.iter().copied())
                .arg(self.url.as_str());
            let output = match runner.run(SVN_TIMEOUT) {
                Ok(output) => output,
                Err(err) if is_timeout(&err) => {
                    return Err(Error::transport(format!("{err:#}")).into());
                }
                Err(err) => return Err(err),
            };
            if output.success() {
                return Ok(output.stdout_text());
            }
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_unknown_revision(&stderr) {
                Err(Error::build(format!("svn log failed: {stderr}")).into())
            } else {
                Err(Error::transport(format!("svn log failed: {stderr}")).into())
            }
        })
    }
}

impl RevisionEngine for SvnEngine {
    fn kind(&self) -> ScmKind {
        ScmKind::Svn
    }

    fn current_revision(&self) -> Result<RevisionInfo> {
        let xml = self.xml_log(&["--limit", "1", "-r", "HEAD"])?;
        parse_xml_log(&xml, &self.build_types)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::build(format!("{} has no revisions", self.url)).into())
    }

    #[instrument(skip_all, fields(since = revision, count))]
    fn revisions_since(&self, revision: &str, count: Option<usize>) -> Result<Vec<RevisionInfo>> {
        let start: u64 = revision.trim().parse().map_err(|_| {
            Error::build(format!("unknown revision '{revision}' (svn revisions are numbers)"))
        })?;
        let range = format!("HEAD:{start}");
        let xml = self.xml_log(&["-r", &range])?;
        let mut revisions: Vec<RevisionInfo> = parse_xml_log(&xml, &self.build_types)?
            .into_iter()
            .filter(|info| info.revision() != start.to_string())
            .collect();
        revisions.sort_by_key(|info| info.revision().parse::<u64>().unwrap_or(0));
        if let Some(count) = count {
            revisions.truncate(count);
        }
        debug!(found = revisions.len(), "revisions since");
        Ok(revisions)
    }
}

fn is_unknown_revision(stderr: &str) -> bool {
    stderr.contains("No such revision") || stderr.contains("E160006")
}

static LOG_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<logentry\s+revision="(\d+)"\s*>(.*?)</logentry>"#).unwrap()
});
static AUTHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<author>(.*?)</author>").unwrap());
static DATE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<date>(.*?)</date>").unwrap());
static MSG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<msg>(.*?)</msg>").unwrap());

/// Parse the `logentry` elements of `svn log --xml` output.
pub fn parse_xml_log(xml: &str, build_types: &BuildTypeTable) -> Result<Vec<RevisionInfo>> {
    let mut revisions = Vec::new();
    for caps in LOG_ENTRY.captures_iter(xml) {
        let revision = caps[1].to_string();
        let body = &caps[2];
        let author = element(&AUTHOR, body).unwrap_or_default();
        let date = element(&DATE, body)
            .ok_or_else(|| anyhow!("svn log entry r{revision} has no date"))?;
        let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(date.trim())
            .with_context(|| format!("parse svn date '{date}'"))?
            .with_timezone(&Utc);
        let message = element(&MSG, body).unwrap_or_default().trim_end().to_string();
        let build_type = build_types.classify(&message);
        revisions.push(RevisionInfo::new(
            CommitFields {
                short_revision: revision.clone(),
                revision,
                committer: author,
                committer_email: None,
                message,
                timestamp,
            },
            build_type,
        ));
    }
    Ok(revisions)
}

fn element(pattern: &Regex, body: &str) -> Option<String> {
    pattern.captures(body).map(|caps| unescape(&caps[1]))
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::build_type::BuildType;

    const LOG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<log>
<logentry
   revision="12">
<author>ada</author>
<date>2024-03-01T10:00:00.123456Z</date>
<msg>[milestone] release &amp; branch &lt;1.0&gt;</msg>
</logentry>
<logentry
   revision="11">
<author>bob</author>
<date>2024-02-29T09:00:00.000000Z</date>
<msg>fix build</msg>
</logentry>
<logentry
   revision="10">
<date>2024-02-28T09:00:00.000000Z</date>
<msg></msg>
</logentry>
</log>
"#;

    #[test]
    fn parses_entries_and_unescapes_messages() {
        let revisions = parse_xml_log(LOG, &BuildTypeTable::standard()).expect("parse");
        assert_eq!(revisions.len(), 3);
        assert_eq!(revisions[0].revision(), "12");
        assert_eq!(revisions[0].committer(), "ada");
        assert_eq!(revisions[0].message(), "[milestone] release & branch <1.0>");
        assert_eq!(revisions[0].build_type(), BuildType::MILESTONE);
        assert_eq!(revisions[1].build_type(), BuildType::CONTINUOUS);
        assert_eq!(revisions[2].committer(), "");
        assert_eq!(revisions[2].message(), "");
    }

    #[test]
    fn entry_without_date_is_rejected() {
        let xml = "<log><logentry revision=\"3\"><author>x</author></logentry></log>";
        assert!(parse_xml_log(xml, &BuildTypeTable::standard()).is_err());
    }

    #[test]
    fn unknown_revision_messages_are_recognized() {
        assert!(is_unknown_revision("svn: E160006: No such revision 99"));
        assert!(!is_unknown_revision("svn: E170013: Unable to connect to a repository"));
    }
}
