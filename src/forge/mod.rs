// SPDX-License-Identifier: AGPL-3.0-or-later

//! Forge integration for posting pull request reviews

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::github::PullRequestTarget;

pub mod github;

/// Unified forge client trait
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Numeric ID of the account the client is authenticated as
    async fn current_user_id(&self) -> Result<u64>;

    /// Paths of every file changed by the pull request
    async fn list_changed_files(&self, target: &PullRequestTarget) -> Result<Vec<String>>;

    /// Create a pending review with inline comments; returns the review ID
    async fn create_review(
        &self,
        target: &PullRequestTarget,
        comments: Vec<DraftReviewComment>,
    ) -> Result<u64>;

    /// Submit a pending review with a verdict
    async fn submit_review(
        &self,
        target: &PullRequestTarget,
        review_id: u64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<()>;
}

/// Side of the diff a comment is anchored to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiffSide {
    /// The new version of the file
    Right,
}

/// A line-anchored comment in a pending review
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DraftReviewComment {
    pub path: String,
    pub line: u32,
    pub side: DiffSide,
    pub body: String,
}

/// Verdict a review is submitted with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewEvent {
    Comment,
    Approve,
}

impl std::fmt::Display for ReviewEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewEvent::Comment => write!(f, "COMMENT"),
            ReviewEvent::Approve => write!(f, "APPROVE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&DiffSide::Right).unwrap(), r#""RIGHT""#);
        assert_eq!(
            serde_json::to_string(&ReviewEvent::Comment).unwrap(),
            r#""COMMENT""#
        );
        assert_eq!(ReviewEvent::Approve.to_string(), "APPROVE");
    }
}
