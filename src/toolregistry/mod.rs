//! Tool registry
//!
//! Resolves the external binaries the agent invokes (kubectl, kustomize,
//! helm, terraform) to paths under the tools directory, falling back to the
//! process PATH. Concurrent lookups of the same tool coalesce behind one
//! probe.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::PipedError;

/// Registry of named tool binaries under the tools directory.
pub struct ToolRegistry {
    tools_dir: PathBuf,
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl ToolRegistry {
    pub fn new(tools_dir: impl Into<PathBuf>) -> Self {
        Self {
            tools_dir: tools_dir.into(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Create the tools directory if needed.
    pub async fn init(&self) -> Result<(), PipedError> {
        tokio::fs::create_dir_all(&self.tools_dir).await?;
        Ok(())
    }

    /// Resolve a tool binary, preferring a versioned install in the tools
    /// directory (`name-version`), then an unversioned one, then PATH.
    pub async fn ensure(&self, name: &str, version: &str) -> Result<PathBuf, PipedError> {
        let key = if version.is_empty() {
            name.to_string()
        } else {
            format!("{}-{}", name, version)
        };

        let mut resolved = self.resolved.lock().await;
        if let Some(path) = resolved.get(&key) {
            return Ok(path.clone());
        }

        let candidates = [self.tools_dir.join(&key), self.tools_dir.join(name)];
        for candidate in &candidates {
            if tokio::fs::metadata(candidate).await.is_ok() {
                debug!("Resolved tool {} to {}", key, candidate.display());
                resolved.insert(key.clone(), candidate.clone());
                return Ok(candidate.clone());
            }
        }

        if let Some(path) = find_in_path(name) {
            debug!("Resolved tool {} from PATH: {}", key, path.display());
            resolved.insert(key, path.clone());
            return Ok(path);
        }

        Err(PipedError::ToolError(format!(
            "tool {} not found in {} or PATH",
            key,
            self.tools_dir.display()
        )))
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tools_dir_preferred_over_path() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());
        registry.init().await.unwrap();

        tokio::fs::write(dir.path().join("kubectl-1.19"), b"#!/bin/sh\n")
            .await
            .unwrap();

        let path = registry.ensure("kubectl", "1.19").await.unwrap();
        assert_eq!(path, dir.path().join("kubectl-1.19"));
    }

    #[tokio::test]
    async fn test_path_fallback_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path());
        registry.init().await.unwrap();

        // git is guaranteed present in the test environment.
        assert!(registry.ensure("git", "").await.is_ok());
        assert!(registry.ensure("definitely-not-a-tool", "").await.is_err());
    }
}
