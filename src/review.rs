// SPDX-License-Identifier: AGPL-3.0-or-later

//! Turns findings into a pull request review

use anyhow::{Context, Result};
use tracing::info;

use crate::finding::Finding;
use crate::forge::{DiffSide, DraftReviewComment, ForgeClient, ReviewEvent};
use crate::github::PullRequestTarget;

pub const REREVIEW_NOTE: &str = "Please re-request review from the bot after applying these fixes";
pub const APPROVAL_NOTE: &str = "No issues found!";

/// Body of the inline comment for a finding
pub fn comment_body(finding: &Finding) -> String {
    let mut body = finding.render(true);
    if let Some(extra) = &finding.extra {
        body.push_str("\n\n");
        body.push_str(extra);
    }
    body
}

pub fn draft_comments(path: &str, findings: &[Finding]) -> Vec<DraftReviewComment> {
    findings
        .iter()
        .map(|finding| DraftReviewComment {
            path: path.to_string(),
            line: finding.reported_line(),
            side: DiffSide::Right,
            body: comment_body(finding),
        })
        .collect()
}

/// Post one review for `path`: inline comments when there are findings,
/// otherwise an approval
pub async fn publish_review(
    forge: &dyn ForgeClient,
    target: &PullRequestTarget,
    path: &str,
    findings: &[Finding],
) -> Result<()> {
    let (comments, event, body) = if findings.is_empty() {
        (Vec::new(), ReviewEvent::Approve, APPROVAL_NOTE)
    } else {
        (
            draft_comments(path, findings),
            ReviewEvent::Comment,
            REREVIEW_NOTE,
        )
    };

    let review_id = forge
        .create_review(target, comments)
        .await
        .with_context(|| format!("Failed to create review for {}", path))?;
    forge
        .submit_review(target, review_id, event, body)
        .await
        .with_context(|| format!("Failed to submit review for {}", path))?;

    info!(
        pr = %target,
        path,
        findings = findings.len(),
        "Published {} review",
        event
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every call a review would make
    #[derive(Default)]
    pub(crate) struct RecordingForge {
        pub user_id: u64,
        pub changed: Vec<String>,
        pub created: Mutex<Vec<Vec<DraftReviewComment>>>,
        pub submitted: Mutex<Vec<(u64, ReviewEvent, String)>>,
        pub fail_submit: bool,
    }

    #[async_trait]
    impl ForgeClient for RecordingForge {
        async fn current_user_id(&self) -> Result<u64> {
            Ok(self.user_id)
        }

        async fn list_changed_files(&self, _: &PullRequestTarget) -> Result<Vec<String>> {
            Ok(self.changed.clone())
        }

        async fn create_review(
            &self,
            _: &PullRequestTarget,
            comments: Vec<DraftReviewComment>,
        ) -> Result<u64> {
            let mut created = self.created.lock().unwrap();
            created.push(comments);
            Ok(created.len() as u64)
        }

        async fn submit_review(
            &self,
            _: &PullRequestTarget,
            review_id: u64,
            event: ReviewEvent,
            body: &str,
        ) -> Result<()> {
            if self.fail_submit {
                anyhow::bail!("Failed to submit review: 502 Bad Gateway - ");
            }
            self.submitted
                .lock()
                .unwrap()
                .push((review_id, event, body.to_string()));
            Ok(())
        }
    }

    pub(crate) fn target() -> PullRequestTarget {
        PullRequestTarget {
            owner: "lure".into(),
            repo: "repo".into(),
            number: 3,
        }
    }

    #[tokio::test]
    async fn test_no_findings_approves() {
        let forge = RecordingForge::default();
        publish_review(&forge, &target(), "hello/lure.sh", &[])
            .await
            .unwrap();

        let created = forge.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert!(created[0].is_empty());
        let submitted = forge.submitted.lock().unwrap();
        assert_eq!(
            *submitted,
            vec![(1, ReviewEvent::Approve, APPROVAL_NOTE.to_string())]
        );
    }

    #[tokio::test]
    async fn test_findings_become_inline_comments() {
        let forge = RecordingForge::default();
        let mut release = Finding::variable("release", "The {} must be an integer");
        release.line = 4;
        let findings = vec![
            Finding::variable("name", "The {} is required"),
            release,
            Finding::variable("license", "The {} contains 'X'.").with_extra("See the list."),
        ];
        publish_review(&forge, &target(), "hello/lure.sh", &findings)
            .await
            .unwrap();

        let created = forge.created.lock().unwrap();
        let comments = &created[0];
        assert_eq!(comments.len(), 3);
        assert_eq!(comments[0].line, 1);
        assert_eq!(comments[1].line, 4);
        assert!(comments.iter().all(|c| c.side == DiffSide::Right));
        assert!(comments.iter().all(|c| c.path == "hello/lure.sh"));
        assert_eq!(comments[0].body, "The `name` variable is required");
        assert_eq!(
            comments[2].body,
            "The `license` variable contains 'X'.\n\nSee the list."
        );

        let submitted = forge.submitted.lock().unwrap();
        assert_eq!(submitted[0].1, ReviewEvent::Comment);
        assert_eq!(submitted[0].2, REREVIEW_NOTE);
    }

    #[tokio::test]
    async fn test_submit_failure_is_reported() {
        let forge = RecordingForge {
            fail_submit: true,
            ..Default::default()
        };
        let err = publish_review(&forge, &target(), "a/lure.sh", &[])
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("502"));
    }
}
