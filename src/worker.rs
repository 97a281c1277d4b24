// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker pool that turns queued pull request events into reviews

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::fetch::{RecipeFile, RepoFetcher};
use crate::forge::ForgeClient;
use crate::github::{Action, PullRequestEvent, PullRequestTarget};
use crate::licenses::LicenseRegistry;
use crate::queue::JobReceiver;
use crate::review::publish_review;
use crate::rules;
use crate::sandbox::{self, Limits};

/// Everything a worker needs to review one pull request
pub struct Pipeline {
    pub forge: Arc<dyn ForgeClient>,
    pub fetcher: Arc<dyn RepoFetcher>,
    pub licenses: Arc<LicenseRegistry>,
    pub limits: Limits,
    pub job_timeout: Duration,
}

/// What happened to one recipe of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Reviewed { path: String, findings: usize },
    Skipped { path: String, reason: String },
}

impl Pipeline {
    /// Whether the event asks for a review from this bot
    pub async fn is_actionable(&self, event: &PullRequestEvent) -> Result<bool> {
        if !event.action.is_reviewable() || event.pull_request.draft {
            return Ok(false);
        }
        if event.action != Action::ReviewRequested {
            return Ok(true);
        }

        let me = self
            .forge
            .current_user_id()
            .await
            .context("Failed to look up bot account")?;
        Ok(event
            .pull_request
            .requested_reviewers
            .iter()
            .any(|reviewer| reviewer.id == me))
    }

    /// Review every changed recipe in the pull request
    pub async fn process(&self, event: &PullRequestEvent) -> Result<Vec<FileOutcome>> {
        let target = PullRequestTarget::from_event(event);
        if !self.is_actionable(event).await? {
            debug!(pr = %target, action = ?event.action, "Ignoring event");
            return Ok(Vec::new());
        }

        let changed: HashSet<String> = self
            .forge
            .list_changed_files(&target)
            .await
            .context("Failed to list changed files")?
            .into_iter()
            .collect();

        let head = &event.pull_request.head;
        let recipes = self
            .fetcher
            .fetch_recipes(head.repo.fetch_url(), &head.sha, &changed)
            .await
            .context("Failed to fetch repository")?;
        info!(pr = %target, recipes = recipes.len(), "Reviewing changed recipes");

        let mut outcomes = Vec::with_capacity(recipes.len());
        for recipe in recipes {
            outcomes.push(self.review_file(&target, recipe).await?);
        }
        Ok(outcomes)
    }

    async fn review_file(
        &self,
        target: &PullRequestTarget,
        recipe: RecipeFile,
    ) -> Result<FileOutcome> {
        let RecipeFile { path, source } = recipe;
        let limits = self.limits;
        let evaluated =
            tokio::task::spawn_blocking(move || sandbox::evaluate_with(&source, limits))
                .await
                .context("Sandbox task failed")?;

        let bindings = match evaluated {
            Ok(bindings) => bindings,
            Err(e) => {
                warn!(pr = %target, path = %path, "Error running script: {}", e);
                return Ok(FileOutcome::Skipped {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        let findings = rules::validate(&bindings, &self.licenses);
        publish_review(self.forge.as_ref(), target, &path, &findings).await?;
        Ok(FileOutcome::Reviewed {
            path,
            findings: findings.len(),
        })
    }

    /// Process one job under the per-job timeout, logging instead of failing
    pub async fn run_job(&self, event: PullRequestEvent) {
        let target = PullRequestTarget::from_event(&event);
        match tokio::time::timeout(self.job_timeout, self.process(&event)).await {
            Ok(Ok(outcomes)) => debug!(pr = %target, files = outcomes.len(), "Job finished"),
            Ok(Err(e)) => error!(pr = %target, "Job failed: {:#}", e),
            Err(_) => error!(
                pr = %target,
                "Job timed out after {}s",
                self.job_timeout.as_secs()
            ),
        }
    }
}

/// Start `count` workers pulling from `jobs` until the queue closes
pub fn spawn_workers(
    count: usize,
    jobs: JobReceiver<PullRequestEvent>,
    pipeline: Arc<Pipeline>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|id| {
            let jobs = jobs.clone();
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                debug!(worker = id, "Worker started");
                while let Some(event) = jobs.recv().await {
                    pipeline.run_job(event).await;
                }
                debug!(worker = id, "Worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::ReviewEvent;
    use crate::github::{CommitRef, PullRequest, Repository, User};
    use crate::licenses::LicenseEntry;
    use crate::queue::JobQueue;
    use crate::review::tests::RecordingForge;
    use crate::review::{APPROVAL_NOTE, REREVIEW_NOTE};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    const VALID: &str = "name=hello\nversion=1.0\nrelease=1\nlicense=('MIT')\npackage() { :; }\n";

    struct StaticFetcher {
        recipes: Vec<RecipeFile>,
        requests: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl StaticFetcher {
        fn new(recipes: &[(&str, &str)]) -> Self {
            Self {
                recipes: recipes
                    .iter()
                    .map(|(path, source)| RecipeFile {
                        path: path.to_string(),
                        source: source.to_string(),
                    })
                    .collect(),
                requests: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl RepoFetcher for StaticFetcher {
        async fn fetch_recipes(
            &self,
            clone_url: &str,
            sha: &str,
            changed: &HashSet<String>,
        ) -> Result<Vec<RecipeFile>> {
            self.requests
                .lock()
                .unwrap()
                .push((clone_url.to_string(), sha.to_string()));
            if self.fail {
                anyhow::bail!("git clone failed: exit status: 128 - not found");
            }
            Ok(self
                .recipes
                .iter()
                .filter(|recipe| changed.contains(&recipe.path))
                .cloned()
                .collect())
        }
    }

    fn repo(owner: &str) -> Repository {
        Repository {
            name: "lure-repo".into(),
            full_name: format!("{}/lure-repo", owner),
            owner: User {
                login: owner.into(),
                id: 1,
            },
            html_url: format!("https://github.com/{}/lure-repo", owner),
            clone_url: format!("https://github.com/{}/lure-repo.git", owner),
        }
    }

    fn event(action: Action) -> PullRequestEvent {
        PullRequestEvent {
            action,
            number: 3,
            pull_request: PullRequest {
                number: 3,
                draft: false,
                title: "Add hello".into(),
                requested_reviewers: Vec::new(),
                head: CommitRef {
                    sha: "0123abcd".into(),
                    ref_name: "hello".into(),
                    repo: repo("contributor"),
                },
                base: CommitRef {
                    sha: "4567ef01".into(),
                    ref_name: "master".into(),
                    repo: repo("lure"),
                },
            },
            repository: None,
        }
    }

    fn pipeline(forge: Arc<RecordingForge>, fetcher: Arc<StaticFetcher>) -> Pipeline {
        Pipeline {
            forge,
            fetcher,
            licenses: Arc::new(LicenseRegistry::from_entries(vec![
                LicenseEntry::new("MIT"),
                LicenseEntry::new("GPL-3.0-only"),
            ])),
            limits: Limits::default(),
            job_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_actionable_events() {
        let forge = Arc::new(RecordingForge {
            user_id: 42,
            ..Default::default()
        });
        let pipeline = pipeline(forge, Arc::new(StaticFetcher::new(&[])));

        assert!(pipeline.is_actionable(&event(Action::Opened)).await.unwrap());
        assert!(pipeline
            .is_actionable(&event(Action::ReadyForReview))
            .await
            .unwrap());
        assert!(!pipeline
            .is_actionable(&event(Action::Synchronize))
            .await
            .unwrap());

        let mut draft = event(Action::Opened);
        draft.pull_request.draft = true;
        assert!(!pipeline.is_actionable(&draft).await.unwrap());

        let mut requested = event(Action::ReviewRequested);
        requested.pull_request.requested_reviewers = vec![User {
            login: "someone".into(),
            id: 7,
        }];
        assert!(!pipeline.is_actionable(&requested).await.unwrap());
        requested.pull_request.requested_reviewers.push(User {
            login: "lure-bot".into(),
            id: 42,
        });
        assert!(pipeline.is_actionable(&requested).await.unwrap());
    }

    #[tokio::test]
    async fn test_reviews_each_changed_recipe() {
        let forge = Arc::new(RecordingForge {
            changed: vec!["hello/lure.sh".into(), "broken/lure.sh".into()],
            ..Default::default()
        });
        let fetcher = Arc::new(StaticFetcher::new(&[
            ("hello/lure.sh", VALID),
            ("broken/lure.sh", "version=1.0\nrelease=x\n"),
            ("untouched/lure.sh", VALID),
        ]));
        let pipeline = pipeline(Arc::clone(&forge), Arc::clone(&fetcher));

        let outcomes = pipeline.process(&event(Action::Opened)).await.unwrap();
        assert_eq!(
            outcomes,
            vec![
                FileOutcome::Reviewed {
                    path: "hello/lure.sh".into(),
                    findings: 0,
                },
                FileOutcome::Reviewed {
                    path: "broken/lure.sh".into(),
                    findings: 3,
                },
            ]
        );

        let requests = fetcher.requests.lock().unwrap();
        assert_eq!(
            *requests,
            vec![(
                "https://github.com/contributor/lure-repo.git".to_string(),
                "0123abcd".to_string()
            )]
        );

        let submitted = forge.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].1, ReviewEvent::Approve);
        assert_eq!(submitted[0].2, APPROVAL_NOTE);
        assert_eq!(submitted[1].1, ReviewEvent::Comment);
        assert_eq!(submitted[1].2, REREVIEW_NOTE);
        assert_eq!(forge.created.lock().unwrap()[1].len(), 3);
    }

    #[tokio::test]
    async fn test_sandbox_error_skips_only_that_file() {
        let forge = Arc::new(RecordingForge {
            changed: vec!["bad/lure.sh".into(), "hello/lure.sh".into()],
            ..Default::default()
        });
        let fetcher = Arc::new(StaticFetcher::new(&[
            ("bad/lure.sh", "name='unterminated\n"),
            ("hello/lure.sh", VALID),
        ]));
        let pipeline = pipeline(Arc::clone(&forge), fetcher);

        let outcomes = pipeline.process(&event(Action::Opened)).await.unwrap();
        assert!(matches!(&outcomes[0], FileOutcome::Skipped { path, .. } if path == "bad/lure.sh"));
        assert!(matches!(&outcomes[1], FileOutcome::Reviewed { findings: 0, .. }));
        assert_eq!(forge.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_abandons_job() {
        let forge = Arc::new(RecordingForge {
            changed: vec!["hello/lure.sh".into()],
            ..Default::default()
        });
        let mut fetcher = StaticFetcher::new(&[("hello/lure.sh", VALID)]);
        fetcher.fail = true;
        let pipeline = pipeline(Arc::clone(&forge), Arc::new(fetcher));

        let err = pipeline.process(&event(Action::Opened)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to fetch repository"));
        assert!(forge.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_review_failure_abandons_job() {
        let forge = Arc::new(RecordingForge {
            changed: vec!["a/lure.sh".into(), "b/lure.sh".into()],
            fail_submit: true,
            ..Default::default()
        });
        let fetcher = Arc::new(StaticFetcher::new(&[
            ("a/lure.sh", VALID),
            ("b/lure.sh", VALID),
        ]));
        let pipeline = pipeline(Arc::clone(&forge), fetcher);

        assert!(pipeline.process(&event(Action::Opened)).await.is_err());
        assert_eq!(forge.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ignored_event_makes_no_calls() {
        let forge = Arc::new(RecordingForge {
            changed: vec!["hello/lure.sh".into()],
            ..Default::default()
        });
        let fetcher = Arc::new(StaticFetcher::new(&[("hello/lure.sh", VALID)]));
        let pipeline = pipeline(Arc::clone(&forge), Arc::clone(&fetcher));

        let outcomes = pipeline.process(&event(Action::Closed)).await.unwrap();
        assert!(outcomes.is_empty());
        assert!(fetcher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_stop() {
        let forge = Arc::new(RecordingForge {
            changed: vec!["hello/lure.sh".into()],
            ..Default::default()
        });
        let fetcher = Arc::new(StaticFetcher::new(&[("hello/lure.sh", VALID)]));
        let pipeline = Arc::new(pipeline(Arc::clone(&forge), fetcher));

        let shutdown = CancellationToken::new();
        let (queue, jobs) = JobQueue::start(shutdown.clone());
        let workers = spawn_workers(3, jobs, pipeline);
        for _ in 0..5 {
            queue.enqueue(event(Action::Opened));
        }

        for _ in 0..200 {
            if forge.submitted.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(forge.submitted.lock().unwrap().len(), 5);

        shutdown.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
