// SPDX-License-Identifier: AGPL-3.0-or-later

//! GitHub webhook payloads and signature verification
//!
//! Only the fields the bot reads are modelled; everything else in the
//! payload is ignored, and missing optional fields fall back to defaults so
//! that trimmed payloads from compatible forges still decode.

use serde::{Deserialize, Serialize};

/// The only event type the bot accepts
pub const PULL_REQUEST_EVENT: &str = "pull_request";

/// Pull request webhook actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Opened,
    ReadyForReview,
    ReviewRequested,
    Synchronize,
    Reopened,
    Closed,
    Edited,
    #[serde(other)]
    Other,
}

impl Action {
    /// Actions that trigger a review
    pub fn is_reviewable(&self) -> bool {
        matches!(
            self,
            Action::Opened | Action::ReadyForReview | Action::ReviewRequested
        )
    }
}

/// `pull_request` webhook payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub action: Action,
    #[serde(default)]
    pub number: u64,
    pub pull_request: PullRequest,
    #[serde(default)]
    pub repository: Option<Repository>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub requested_reviewers: Vec<User>,
    pub head: CommitRef,
    pub base: CommitRef,
}

/// Head or base of a pull request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    #[serde(rename = "ref", default)]
    pub ref_name: String,
    pub repo: Repository,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    pub owner: User,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub clone_url: String,
}

impl Repository {
    /// URL to clone from; some forges only send the web URL
    pub fn fetch_url(&self) -> &str {
        if self.clone_url.is_empty() {
            &self.html_url
        } else {
            &self.clone_url
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub id: u64,
}

/// Identifies the pull request that reviews are posted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestTarget {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PullRequestTarget {
    /// Reviews go to the base repository, which owns the pull request
    pub fn from_event(event: &PullRequestEvent) -> Self {
        let base = &event.pull_request.base.repo;
        Self {
            owner: base.owner.login.clone(),
            repo: base.name.clone(),
            number: event.pull_request.number,
        }
    }
}

impl std::fmt::Display for PullRequestTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

/// Verify webhook signature
pub fn verify_webhook_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let expected = format!(
        "sha256={}",
        hex::encode(hmac_sha256::HMAC::mac(payload, secret.as_bytes()))
    );

    // Constant-time comparison
    signature.len() == expected.len()
        && signature
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_signature_verification() {
        let payload = b"test payload";
        let secret = "test-secret";

        let signature = format!(
            "sha256={}",
            hex::encode(hmac_sha256::HMAC::mac(payload, secret.as_bytes()))
        );

        assert!(verify_webhook_signature(payload, &signature, secret));
        assert!(!verify_webhook_signature(payload, "sha256=invalid", secret));
        assert!(!verify_webhook_signature(payload, &signature, "wrong-secret"));
        assert!(!verify_webhook_signature(payload, "", secret));
    }

    #[test]
    fn test_minimal_payload_decodes() {
        let json = r#"{
            "action": "opened",
            "pull_request": {
                "number": 7,
                "head": {"sha": "abc", "repo": {"name": "lure-repo", "owner": {"login": "fork"}}},
                "base": {"sha": "def", "repo": {"name": "lure-repo", "owner": {"login": "upstream"}}}
            }
        }"#;
        let event: PullRequestEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.action, Action::Opened);
        assert!(!event.pull_request.draft);
        assert!(event.pull_request.requested_reviewers.is_empty());

        let target = PullRequestTarget::from_event(&event);
        assert_eq!(target.to_string(), "upstream/lure-repo#7");
    }

    #[test]
    fn test_unknown_action() {
        let action: Action = serde_json::from_str(r#""auto_merge_enabled""#).unwrap();
        assert_eq!(action, Action::Other);
        assert!(!action.is_reviewable());
        assert!(Action::ReviewRequested.is_reviewable());
    }

    #[test]
    fn test_fetch_url_falls_back_to_html_url() {
        let mut repo = Repository {
            name: "r".into(),
            full_name: String::new(),
            owner: User {
                login: "o".into(),
                id: 1,
            },
            html_url: "https://example.com/o/r".into(),
            clone_url: String::new(),
        };
        assert_eq!(repo.fetch_url(), "https://example.com/o/r");
        repo.clone_url = "https://example.com/o/r.git".into();
        assert_eq!(repo.fetch_url(), "https://example.com/o/r.git");
    }
}
