// SPDX-License-Identifier: AGPL-3.0-or-later

//! Retrieval of recipe files, from a remote repository at a commit or from
//! the local filesystem

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

/// Paths containing this are treated as recipes
pub const RECIPE_MARKER: &str = "lure.sh";

/// Prefix of per-job scratch directories
pub const WORKSPACE_PREFIX: &str = "lure-repo-bot.";

/// A recipe read from a repository tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeFile {
    /// Path relative to the repository root
    pub path: String,
    pub source: String,
}

#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Read every recipe at `sha` whose path is in `changed`
    async fn fetch_recipes(
        &self,
        clone_url: &str,
        sha: &str,
        changed: &HashSet<String>,
    ) -> Result<Vec<RecipeFile>>;
}

/// Tree paths that are recipes touched by the change
pub fn select_recipe_paths(tree: &[String], changed: &HashSet<String>) -> Vec<String> {
    tree.iter()
        .filter(|path| path.contains(RECIPE_MARKER) && changed.contains(*path))
        .cloned()
        .collect()
}

/// Fetches with the `git` command line into a private temporary directory
pub struct GitFetcher {
    git: PathBuf,
    scratch_root: PathBuf,
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
            scratch_root: std::env::temp_dir(),
        }
    }
}

impl GitFetcher {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            ..Self::default()
        }
    }

    async fn git(&self, repo: &Path, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new(&self.git)
            .arg("-C")
            .arg(repo)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.first().unwrap_or(&"")))?;

        if !output.status.success() {
            anyhow::bail!(
                "git {} failed: {} - {}",
                args.first().unwrap_or(&""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

fn is_object_id(sha: &str) -> bool {
    !sha.is_empty() && sha.len() <= 64 && sha.bytes().all(|b| b.is_ascii_hexdigit())
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch_recipes(
        &self,
        clone_url: &str,
        sha: &str,
        changed: &HashSet<String>,
    ) -> Result<Vec<RecipeFile>> {
        if !is_object_id(sha) {
            anyhow::bail!("Invalid commit id: {:?}", sha);
        }

        // removed when dropped, whichever way this returns
        let workspace = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.scratch_root)
            .context("Failed to create temporary directory")?;
        let repo = workspace.path().join("repo.git");
        let repo_arg = repo.to_string_lossy().into_owned();

        debug!("Cloning {} into {}", clone_url, repo.display());
        self.git(
            workspace.path(),
            &["clone", "--bare", "--quiet", "--no-tags", "--", clone_url, repo_arg.as_str()],
        )
        .await
        .with_context(|| format!("Failed to clone {}", clone_url))?;

        let listing = self
            .git(&repo, &["ls-tree", "-r", "-z", "--name-only", sha])
            .await
            .with_context(|| format!("Failed to list files at {}", sha))?;
        let tree: Vec<String> = listing
            .split(|b| *b == 0)
            .filter(|entry| !entry.is_empty())
            .map(|entry| String::from_utf8_lossy(entry).into_owned())
            .collect();

        let mut recipes = Vec::new();
        for path in select_recipe_paths(&tree, changed) {
            let object = format!("{}:{}", sha, path);
            let blob = self
                .git(&repo, &["cat-file", "blob", object.as_str()])
                .await
                .with_context(|| format!("Failed to read {}", path))?;
            recipes.push(RecipeFile {
                path,
                source: String::from_utf8_lossy(&blob).into_owned(),
            });
        }

        debug!(
            "{} of {} files at {} are changed recipes",
            recipes.len(),
            tree.len(),
            sha
        );
        Ok(recipes)
    }
}

/// Expand files and directories into the recipe files they contain
pub fn local_recipes(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for path in paths {
        if path.is_file() {
            found.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            anyhow::bail!("{} does not exist", path.display());
        }
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
            if entry.file_type().is_file() && entry.file_name() == RECIPE_MARKER {
                found.push(entry.into_path());
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn changed(paths: &[&str]) -> HashSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_select_recipe_paths() {
        let tree = vec![
            "README.md".to_string(),
            "hello/lure.sh".to_string(),
            "world/lure.sh".to_string(),
            "world/patch.diff".to_string(),
        ];
        let selected = select_recipe_paths(
            &tree,
            &changed(&["hello/lure.sh", "world/patch.diff", "gone/lure.sh"]),
        );
        assert_eq!(selected, vec!["hello/lure.sh"]);
    }

    #[test]
    fn test_object_id_validation() {
        assert!(is_object_id("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_object_id(""));
        assert!(!is_object_id("--upload-pack=evil"));
    }

    #[test]
    fn test_local_recipes_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b/c")).unwrap();
        std::fs::write(dir.path().join("a/lure.sh"), "").unwrap();
        std::fs::write(dir.path().join("b/c/lure.sh"), "").unwrap();
        std::fs::write(dir.path().join("b/notes.txt"), "").unwrap();
        let single = dir.path().join("other.sh");
        std::fs::write(&single, "").unwrap();

        let found = local_recipes(&[dir.path().to_path_buf(), single.clone()]).unwrap();
        assert_eq!(
            found,
            vec![
                dir.path().join("a/lure.sh"),
                dir.path().join("b/c/lure.sh"),
                single,
            ]
        );
        assert!(local_recipes(&[dir.path().join("missing")]).is_err());
    }

    fn git(dir: &Path, args: &[&str]) -> Option<String> {
        let output = StdCommand::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
            .args(args)
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    #[tokio::test]
    async fn test_git_fetcher_reads_changed_recipes() {
        let origin = tempfile::tempdir().unwrap();
        if git(origin.path(), &["init", "--quiet"]).is_none() {
            // git is not installed
            return;
        }
        std::fs::create_dir_all(origin.path().join("hello")).unwrap();
        std::fs::create_dir_all(origin.path().join("world")).unwrap();
        std::fs::write(origin.path().join("hello/lure.sh"), "name=hello\n").unwrap();
        std::fs::write(origin.path().join("world/lure.sh"), "name=world\n").unwrap();
        git(origin.path(), &["add", "."]).unwrap();
        git(origin.path(), &["commit", "--quiet", "-m", "init"]).unwrap();
        let sha = git(origin.path(), &["rev-parse", "HEAD"]).unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let fetcher = GitFetcher::new(scratch.path());
        let recipes = fetcher
            .fetch_recipes(
                &origin.path().to_string_lossy(),
                &sha,
                &changed(&["hello/lure.sh"]),
            )
            .await
            .unwrap();

        assert_eq!(
            recipes,
            vec![RecipeFile {
                path: "hello/lure.sh".into(),
                source: "name=hello\n".into(),
            }]
        );
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_git_fetcher_cleans_up_on_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let fetcher = GitFetcher::new(scratch.path());
        let missing = scratch.path().join("no-such-repo");
        let result = fetcher
            .fetch_recipes(
                &missing.to_string_lossy(),
                "0123456789abcdef0123456789abcdef01234567",
                &HashSet::new(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }
}
