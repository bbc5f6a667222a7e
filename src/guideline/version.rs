//! Version numbers, persisted version records and version comparison.

use crate::error::GuidelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// `major.minor` version; the first version of every document is `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionNumber {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionBump {
    #[default]
    Minor,
    Major,
}

impl VersionNumber {
    pub const INITIAL: VersionNumber = VersionNumber { major: 1, minor: 0 };

    pub fn next(self, bump: VersionBump) -> Self {
        match bump {
            VersionBump::Minor => Self {
                major: self.major,
                minor: self.minor + 1,
            },
            VersionBump::Major => Self {
                major: self.major + 1,
                minor: 0,
            },
        }
    }

    /// Zero-padded form whose byte order matches version order.
    pub(crate) fn sort_key(self) -> String {
        format!("{:010}.{:010}", self.major, self.minor)
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for VersionNumber {
    type Err = GuidelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| GuidelineError::InvalidVersion(s.to_string()))?;
        let major = major
            .parse()
            .map_err(|_| GuidelineError::InvalidVersion(s.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| GuidelineError::InvalidVersion(s.to_string()))?;
        Ok(Self { major, minor })
    }
}

impl Serialize for VersionNumber {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionNumber {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Persisted record of one document version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidelineVersion {
    pub version: VersionNumber,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub author: String,
    pub content_length: usize,
    /// blake3 digest of `content`, hex encoded.
    pub content_digest: String,
}

impl GuidelineVersion {
    pub fn new(
        version: VersionNumber,
        content: String,
        description: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        let content_digest = hex::encode(blake3::hash(content.as_bytes()).as_bytes());
        Self {
            version,
            content_length: content.len(),
            content,
            created_at: Utc::now(),
            description: description.into(),
            author: author.into(),
            content_digest,
        }
    }
}

/// Pointer to the current version of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub version: VersionNumber,
    pub updated_at: DateTime<Utc>,
}

/// Summary of the difference between two versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidelineDiff {
    pub from: VersionNumber,
    pub to: VersionNumber,
    pub identical: bool,
    pub length_delta: i64,
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl GuidelineDiff {
    pub fn between(from: &GuidelineVersion, to: &GuidelineVersion) -> Self {
        let identical = from.content_digest == to.content_digest;
        let (lines_added, lines_removed) = if identical {
            (0, 0)
        } else {
            line_delta(&from.content, &to.content)
        };
        Self {
            from: from.version,
            to: to.version,
            identical,
            length_delta: to.content_length as i64 - from.content_length as i64,
            lines_added,
            lines_removed,
        }
    }
}

/// Multiset line difference: lines of `new` not matched in `old`, and vice versa.
fn line_delta(old: &str, new: &str) -> (usize, usize) {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for line in old.lines() {
        *counts.entry(line).or_default() += 1;
    }
    for line in new.lines() {
        *counts.entry(line).or_default() -= 1;
    }
    counts.values().fold((0, 0), |(added, removed), delta| {
        if *delta < 0 {
            (added + delta.unsigned_abs() as usize, removed)
        } else {
            (added, removed + *delta as usize)
        }
    })
}
