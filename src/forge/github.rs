// SPDX-License-Identifier: AGPL-3.0-or-later

//! GitHub forge client implementation

use super::{DraftReviewComment, ForgeClient, ReviewEvent};
use crate::github::PullRequestTarget;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// GitHub caps `per_page` at 100
const PAGE_SIZE: usize = 100;

pub struct GitHubForgeClient {
    client: Client,
    token: String,
    base_url: String,
    user_id: OnceCell<u64>,
}

impl GitHubForgeClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_API_URL)
    }

    /// Client for GitHub Enterprise or a test server
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("lurebot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: OnceCell::new(),
        })
    }

    fn pulls_url(&self, target: &PullRequestTarget) -> String {
        format!(
            "{}/repos/{}/{}/pulls/{}",
            self.base_url, target.owner, target.repo, target.number
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }
}

/// Turn a non-success response into an error carrying the body
async fn check_status(response: Response, what: &str) -> Result<Response> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Failed to {}: {} - {}", what, status, body);
    }
    Ok(response)
}

#[async_trait]
impl ForgeClient for GitHubForgeClient {
    async fn current_user_id(&self) -> Result<u64> {
        #[derive(Deserialize)]
        struct GitHubUser {
            id: u64,
            login: String,
        }

        let id = self
            .user_id
            .get_or_try_init(|| async {
                let url = format!("{}/user", self.base_url);
                let response = self
                    .authorized(self.client.get(&url))
                    .send()
                    .await
                    .context("Failed to request authenticated user")?;
                let user: GitHubUser = check_status(response, "get authenticated user")
                    .await?
                    .json()
                    .await
                    .context("Failed to parse user response")?;
                info!("Authenticated as {} (ID: {})", user.login, user.id);
                Ok::<_, anyhow::Error>(user.id)
            })
            .await?;
        Ok(*id)
    }

    async fn list_changed_files(&self, target: &PullRequestTarget) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct GitHubFile {
            filename: String,
        }

        let url = format!("{}/files", self.pulls_url(target));
        let mut files = Vec::new();
        for page in 1.. {
            let response = self
                .authorized(self.client.get(&url))
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .send()
                .await
                .context("Failed to list pull request files")?;
            let batch: Vec<GitHubFile> = check_status(response, "list pull request files")
                .await?
                .json()
                .await
                .context("Failed to parse pull request files")?;

            let last = batch.len() < PAGE_SIZE;
            files.extend(batch.into_iter().map(|file| file.filename));
            if last {
                break;
            }
        }

        debug!("{} changed files in {}", files.len(), target);
        Ok(files)
    }

    async fn create_review(
        &self,
        target: &PullRequestTarget,
        comments: Vec<DraftReviewComment>,
    ) -> Result<u64> {
        #[derive(Serialize)]
        struct CreateReview {
            #[serde(skip_serializing_if = "Vec::is_empty")]
            comments: Vec<DraftReviewComment>,
        }

        #[derive(Deserialize)]
        struct GitHubReview {
            id: u64,
        }

        let url = format!("{}/reviews", self.pulls_url(target));
        let count = comments.len();

        let response = self
            .authorized(self.client.post(&url))
            .json(&CreateReview { comments })
            .send()
            .await
            .context("Failed to create review")?;
        let review: GitHubReview = check_status(response, "create review")
            .await?
            .json()
            .await
            .context("Failed to parse review response")?;

        debug!(
            "Created review {} with {} comments on {}",
            review.id, count, target
        );
        Ok(review.id)
    }

    async fn submit_review(
        &self,
        target: &PullRequestTarget,
        review_id: u64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct SubmitReview<'a> {
            body: &'a str,
            event: ReviewEvent,
        }

        let url = format!("{}/reviews/{}/events", self.pulls_url(target), review_id);

        let response = self
            .authorized(self.client.post(&url))
            .json(&SubmitReview { body, event })
            .send()
            .await
            .context("Failed to submit review")?;
        check_status(response, "submit review").await?;

        info!("Submitted review {} on {} as {}", review_id, target, event);
        Ok(())
    }
}
