use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("branch '{branch}' not found in {url}")]
    BranchNotFound { url: String, branch: String },
    #[error("repository not found: {url}")]
    RepositoryNotFound { url: String },
    #[error("git failed: {0}")]
    Failed(String),
}

pub type GitResult<T> = Result<T, GitError>;

/// Clones app sources into app-scoped directories under `<data>/repos/`.
#[derive(Debug, Clone)]
pub struct Git {
    data_dir: PathBuf,
}

impl Git {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn repo_path(&self, app_name: &str) -> PathBuf {
        self.data_dir.join("repos").join(app_name)
    }

    pub fn exists(&self, app_name: &str) -> bool {
        self.repo_path(app_name).is_dir()
    }

    /// Fresh shallow single-branch checkout; any prior clone is discarded
    /// first so every build starts from the branch head.
    pub async fn clone_repo(&self, app_name: &str, url: &str, branch: &str) -> GitResult<()> {
        let path = self.repo_path(app_name);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| GitError::Failed(e.to_string()))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GitError::Failed(e.to_string()))?;
        }

        let path_str = path.to_string_lossy().to_string();
        let args = [
            "clone",
            "--depth",
            "1",
            "--branch",
            branch,
            "--single-branch",
            url,
            &path_str,
        ];
        debug!("git {}", args.join(" "));

        let output = Command::new("git")
            .args(args)
            .output()
            .await
            .map_err(|e| GitError::Failed(e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_clone_error(&stderr, url, branch))
    }

    /// HEAD commit of the current clone as a 40-hex string.
    pub async fn commit_hash(&self, app_name: &str) -> GitResult<String> {
        let path = self.repo_path(app_name);
        let path_str = path.to_string_lossy().to_string();
        let args = ["-C", &path_str, "rev-parse", "HEAD"];
        debug!("git {}", args.join(" "));

        let output = Command::new("git")
            .args(args)
            .output()
            .await
            .map_err(|e| GitError::Failed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(GitError::Failed(stderr));
        }

        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if hash.len() != 40 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GitError::Failed(format!("unexpected rev-parse output: {}", hash)));
        }
        Ok(hash)
    }

    pub fn remove(&self, app_name: &str) -> std::io::Result<()> {
        let path = self.repo_path(app_name);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn classify_clone_error(stderr: &str, url: &str, branch: &str) -> GitError {
    let lower = stderr.to_lowercase();
    if lower.contains("remote branch") && lower.contains("not found") {
        return GitError::BranchNotFound {
            url: url.to_string(),
            branch: branch.to_string(),
        };
    }
    if lower.contains("repository") && (lower.contains("not found") || lower.contains("does not exist"))
        || lower.contains("could not read from remote repository")
    {
        return GitError::RepositoryNotFound { url: url.to_string() };
    }
    GitError::Failed(stderr.to_string())
}
