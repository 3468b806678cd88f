//! Work item identifiers.
//!
//! A work item is the unit flowing through the pipeline (typically an issue
//! number). Its key names the state file and lock file on disk, so it is
//! restricted to a filename-safe alphabet.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a work item key
pub const MAX_WORK_ITEM_LEN: usize = 128;

/// Stable external key of a work item
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkItemId(String);

/// Rejected work item key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidWorkItemId {
    #[error("work item id is empty")]
    Empty,

    #[error("work item id is longer than {MAX_WORK_ITEM_LEN} characters")]
    TooLong,

    #[error("work item id '{0}' may not start with '.'")]
    LeadingDot(String),

    #[error("work item id '{id}' contains invalid character {ch:?} (allowed: A-Z a-z 0-9 - _ .)")]
    InvalidChar { id: String, ch: char },
}

impl WorkItemId {
    /// Validate and wrap a work item key
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidWorkItemId> {
        let id = id.into();

        if id.is_empty() {
            return Err(InvalidWorkItemId::Empty);
        }
        if id.len() > MAX_WORK_ITEM_LEN {
            return Err(InvalidWorkItemId::TooLong);
        }
        if id.starts_with('.') {
            return Err(InvalidWorkItemId::LeadingDot(id));
        }
        if let Some(ch) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(InvalidWorkItemId::InvalidChar { id, ch });
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkItemId {
    type Err = InvalidWorkItemId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorkItemId {
    type Error = InvalidWorkItemId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkItemId> for String {
    fn from(id: WorkItemId) -> Self {
        id.0
    }
}

impl AsRef<str> for WorkItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_issue_numbers_and_slugs() {
        assert_eq!(WorkItemId::new("42").unwrap().as_str(), "42");
        assert!(WorkItemId::new("gh-1234").is_ok());
        assert!(WorkItemId::new("feature_x.v2").is_ok());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        assert_eq!(WorkItemId::new(""), Err(InvalidWorkItemId::Empty));
        assert!(matches!(
            WorkItemId::new("../etc"),
            Err(InvalidWorkItemId::LeadingDot(_))
        ));
        assert!(matches!(
            WorkItemId::new("a/b"),
            Err(InvalidWorkItemId::InvalidChar { ch: '/', .. })
        ));
        assert_eq!(
            WorkItemId::new("x".repeat(MAX_WORK_ITEM_LEN + 1)),
            Err(InvalidWorkItemId::TooLong)
        );
    }

    #[test]
    fn test_deserialization_validates() {
        let ok: WorkItemId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(ok.as_str(), "42");

        let bad: Result<WorkItemId, _> = serde_json::from_str("\"a b\"");
        assert!(bad.is_err());
    }
}
