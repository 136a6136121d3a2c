//! Commit metadata produced by the revision engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::build_type::{BuildType, has_ignore_marker};

/// Metadata for one commit. Fields are private so a value never changes
/// after an engine produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    revision: String,
    short_revision: String,
    committer: String,
    committer_email: Option<String>,
    message: String,
    timestamp: DateTime<Utc>,
    build_type: BuildType,
}

/// Raw fields of a commit, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFields {
    pub revision: String,
    pub short_revision: String,
    pub committer: String,
    pub committer_email: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RevisionInfo {
    pub fn new(fields: CommitFields, build_type: BuildType) -> Self {
        Self {
            revision: fields.revision,
            short_revision: fields.short_revision,
            committer: fields.committer,
            committer_email: fields.committer_email,
            message: fields.message,
            timestamp: fields.timestamp,
            build_type,
        }
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn short_revision(&self) -> &str {
        &self.short_revision
    }

    pub fn committer(&self) -> &str {
        &self.committer
    }

    pub fn committer_email(&self) -> Option<&str> {
        self.committer_email.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or("").trim()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn build_type(&self) -> BuildType {
        self.build_type
    }

    pub fn requests_skip(&self) -> bool {
        has_ignore_marker(&self.message)
    }
}
