//! Source-control descriptor strings (`git:<location>`, `svn:<location>`).

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScmKind {
    Git,
    Svn,
}

impl ScmKind {
    pub fn scheme(self) -> &'static str {
        match self {
            ScmKind::Git => "git",
            ScmKind::Svn => "svn",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmDescriptor {
    pub kind: ScmKind,
    pub location: String,
}

impl ScmDescriptor {
    /// Parse a descriptor.
    ///
    /// An explicit `git:` / `svn:` prefix wins unless it is the start of a
    /// `git://` or `svn://` URL; such URLs (and `svn+ssh://`, `*.git`) are
    /// detected from the location itself.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let descriptor = descriptor.trim();
        for kind in [ScmKind::Git, ScmKind::Svn] {
            if let Some(rest) = descriptor
                .strip_prefix(kind.scheme())
                .and_then(|rest| rest.strip_prefix(':'))
                && !rest.starts_with("//")
            {
                return Self::with_location(kind, rest, descriptor);
            }
        }

        let kind = if descriptor.starts_with("git://") || descriptor.ends_with(".git") {
            ScmKind::Git
        } else if descriptor.starts_with("svn://") || descriptor.starts_with("svn+ssh://") {
            ScmKind::Svn
        } else {
            return Err(Error::configuration(format!(
                "unsupported source control descriptor '{descriptor}' (expected git:<location> or svn:<location>)"
            ))
            .into());
        };
        Self::with_location(kind, descriptor, descriptor)
    }

    fn with_location(kind: ScmKind, location: &str, descriptor: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(Error::configuration(format!(
                "source control descriptor '{descriptor}' has an empty location"
            ))
            .into());
        }
        Ok(Self {
            kind,
            location: location.to_string(),
        })
    }
}

impl fmt::Display for ScmDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.scheme(), self.location)
    }
}

impl FromStr for ScmDescriptor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_configuration;

    #[test]
    fn explicit_prefixes_select_engine() {
        let git = ScmDescriptor::parse("git:/srv/repos/hello").expect("git");
        assert_eq!(git.kind, ScmKind::Git);
        assert_eq!(git.location, "/srv/repos/hello");

        let svn = ScmDescriptor::parse("svn:https://svn.example.org/hello/trunk").expect("svn");
        assert_eq!(svn.kind, ScmKind::Svn);
        assert_eq!(svn.location, "https://svn.example.org/hello/trunk");
    }

    #[test]
    fn scheme_urls_are_detected() {
        let git = ScmDescriptor::parse("git://example.org/hello.git").expect("git url");
        assert_eq!(git.kind, ScmKind::Git);
        assert_eq!(git.location, "git://example.org/hello.git");

        let svn = ScmDescriptor::parse("svn+ssh://example.org/repo").expect("svn url");
        assert_eq!(svn.kind, ScmKind::Svn);

        let dotgit = ScmDescriptor::parse("https://example.org/hello.git").expect("dot git");
        assert_eq!(dotgit.kind, ScmKind::Git);
    }

    #[test]
    fn unknown_schemes_fail() {
        for bad in ["hg:https://example.org/repo", "https://example.org/repo", "git:", ""] {
            let err = ScmDescriptor::parse(bad).expect_err(bad);
            assert!(is_configuration(&err), "{bad}");
        }
    }

    #[test]
    fn display_round_trips() {
        let descriptor = ScmDescriptor::parse("git:/tmp/repo").expect("parse");
        assert_eq!(descriptor.to_string(), "git:/tmp/repo");
        assert_eq!(
            descriptor.to_string().parse::<ScmDescriptor>().expect("reparse"),
            descriptor
        );
    }
}
