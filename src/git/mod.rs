//! Git client
//!
//! Wraps the `git` binary. Each registered repository gets its own working
//! directory; checkout mutates that directory in place, so every sequence
//! of checkout-then-read must hold the repo lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::errors::PipedError;
use crate::model::Commit;

/// Client owning the per-repo working directories.
pub struct GitClient {
    username: String,
    email: String,
    base_dir: PathBuf,
    repos: Mutex<HashMap<String, Arc<Repo>>>,
}

impl GitClient {
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            base_dir: base_dir.into(),
            repos: Mutex::new(HashMap::new()),
        }
    }

    /// Get the working copy for a repository, cloning it on first use.
    pub async fn prepare_repo(
        &self,
        repo_id: &str,
        remote: &str,
        branch: &str,
    ) -> Result<Arc<Repo>, PipedError> {
        let mut repos = self.repos.lock().await;
        if let Some(repo) = repos.get(repo_id) {
            return Ok(repo.clone());
        }

        let dir = self.base_dir.join(repo_id);
        if !dir.join(".git").exists() {
            info!("Cloning repository {} into {}", repo_id, dir.display());
            tokio::fs::create_dir_all(&dir).await?;
            run_git(
                None,
                &["clone", "-b", branch, remote, &dir.to_string_lossy()],
            )
            .await?;
            if !self.username.is_empty() {
                run_git(Some(&dir), &["config", "user.name", &self.username]).await?;
                run_git(Some(&dir), &["config", "user.email", &self.email]).await?;
            }
        }

        let repo = Arc::new(Repo {
            id: repo_id.to_string(),
            branch: branch.to_string(),
            dir,
            lock: Mutex::new(()),
        });
        repos.insert(repo_id.to_string(), repo.clone());
        Ok(repo)
    }

    /// Remove every cloned working directory.
    pub async fn clean(&self) -> Result<(), PipedError> {
        let mut repos = self.repos.lock().await;
        for (_, repo) in repos.drain() {
            if repo.dir.exists() {
                tokio::fs::remove_dir_all(&repo.dir).await?;
            }
        }
        Ok(())
    }
}

/// A cloned repository with an in-place mutable working tree.
pub struct Repo {
    pub id: String,
    pub branch: String,
    dir: PathBuf,
    lock: Mutex<()>,
}

impl Repo {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the repo lock. Hold the guard across checkout and any reads
    /// that must observe the checked-out tree.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Fetch the remote branch and fast-forward the working tree to it.
    pub async fn pull(&self) -> Result<(), PipedError> {
        run_git(Some(&self.dir), &["fetch", "origin", &self.branch]).await?;
        run_git(Some(&self.dir), &["checkout", &self.branch]).await?;
        run_git(
            Some(&self.dir),
            &["reset", "--hard", &format!("origin/{}", self.branch)],
        )
        .await?;
        Ok(())
    }

    /// Check out the given commit, mutating the working tree in place.
    pub async fn checkout(&self, commit_hash: &str) -> Result<(), PipedError> {
        debug!("Checking out {} in repo {}", commit_hash, self.id);
        run_git(Some(&self.dir), &["checkout", "--quiet", commit_hash]).await?;
        Ok(())
    }

    /// The commit the working tree currently points at.
    pub async fn head_commit(&self) -> Result<Commit, PipedError> {
        let out = run_git(
            Some(&self.dir),
            &["log", "-1", "--format=%H%x1f%an%x1f%s"],
        )
        .await?;
        let mut parts = out.trim().split('\u{1f}');
        let hash = parts.next().unwrap_or_default().to_string();
        let author = parts.next().unwrap_or_default().to_string();
        let message = parts.next().unwrap_or_default().to_string();
        if hash.is_empty() {
            return Err(PipedError::GitError(format!(
                "unable to resolve HEAD of repo {}",
                self.id
            )));
        }
        Ok(Commit {
            hash,
            message,
            author,
            branch: self.branch.clone(),
            created_at: None,
        })
    }

    /// Repo-relative paths changed between two commits.
    pub async fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>, PipedError> {
        let range = format!("{}..{}", from, to);
        let out = run_git(Some(&self.dir), &["diff", "--name-only", &range]).await?;
        Ok(out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

async fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String, PipedError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    let output: Output = cmd
        .args(args)
        .output()
        .await
        .map_err(|e| PipedError::GitError(format!("failed to run git {}: {}", args[0], e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipedError::GitError(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_fixture_repo(dir: &Path) {
        run_git(None, &["init", "-b", "master", &dir.to_string_lossy()])
            .await
            .unwrap();
        run_git(Some(dir), &["config", "user.name", "tester"])
            .await
            .unwrap();
        run_git(Some(dir), &["config", "user.email", "tester@example.com"])
            .await
            .unwrap();
    }

    async fn commit_file(dir: &Path, name: &str, content: &str, message: &str) -> String {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, content).await.unwrap();
        run_git(Some(dir), &["add", "."]).await.unwrap();
        run_git(Some(dir), &["commit", "-m", message]).await.unwrap();
        run_git(Some(dir), &["rev-parse", "HEAD"])
            .await
            .unwrap()
            .trim()
            .to_string()
    }

    #[tokio::test]
    async fn test_head_and_changed_files() {
        let upstream = tempfile::tempdir().unwrap();
        init_fixture_repo(upstream.path()).await;
        let first = commit_file(upstream.path(), "a.yaml", "a: 1", "add a").await;
        let second = commit_file(upstream.path(), "app/b.yaml", "b: 2", "add b").await;

        let workspace = tempfile::tempdir().unwrap();
        let client = GitClient::new("piped", "piped@example.com", workspace.path());
        let repo = client
            .prepare_repo("main", &upstream.path().to_string_lossy(), "master")
            .await
            .unwrap();

        let head = repo.head_commit().await.unwrap();
        assert_eq!(head.hash, second);
        assert_eq!(head.message, "add b");

        let changed = repo.changed_files(&first, &second).await.unwrap();
        assert_eq!(changed, vec!["app/b.yaml".to_string()]);

        // Checkout mutates the tree in place.
        repo.checkout(&first).await.unwrap();
        assert!(!repo.dir().join("app/b.yaml").exists());
        repo.checkout(&second).await.unwrap();
        assert!(repo.dir().join("app/b.yaml").exists());
    }
}
