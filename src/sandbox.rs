//! Workspace provider contract and the local directory implementation.
//!
//! The integration workspace is the one piece of mutable shared state in a
//! run. Everything the engine does to it goes through [`WorkspaceProvider`],
//! so remote sandbox backends and in-memory test doubles plug in behind the
//! same seam.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Directories never captured into snapshots and preserved across restores.
const DEPENDENCY_DIRS: &[&str] = &["node_modules", ".git", ".next", "dist", "build", "target"];

/// Result of a command executed inside the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Identity and preview endpoint of a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    #[serde(default)]
    pub preview_url: Option<String>,
}

/// The narrow contract the orchestrator consumes a sandbox through.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// All workspace-relative file paths, dependency directories excluded.
    async fn list_files(&self) -> Result<Vec<String>>;

    async fn read_file(&self, path: &str) -> Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn delete_path(&self, path: &str) -> Result<()>;

    /// Run a shell command with the workspace as working directory.
    async fn run_command(&self, command: &str) -> Result<CommandOutput>;

    async fn install_packages(&self, packages: &[String]) -> Result<()>;

    async fn sandbox_info(&self) -> Result<SandboxInfo>;
}

/// Capture the full workspace tree: `list_files` + `read_file` per entry.
pub async fn capture_snapshot(
    provider: &dyn WorkspaceProvider,
) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for path in provider.list_files().await? {
        let content = provider
            .read_file(&path)
            .await
            .with_context(|| format!("Failed to read {} during snapshot capture", path))?;
        files.insert(path, content);
    }
    Ok(files)
}

/// Reset the workspace to a known-good file map: wipe everything except the
/// dependency caches, then rewrite every entry.
pub async fn restore_snapshot(
    provider: &dyn WorkspaceProvider,
    files: &BTreeMap<String, String>,
) -> Result<()> {
    for path in provider.list_files().await? {
        if !files.contains_key(&path) {
            provider
                .delete_path(&path)
                .await
                .with_context(|| format!("Failed to delete {} during restore", path))?;
        }
    }
    for (path, content) in files {
        provider
            .write_file(path, content)
            .await
            .with_context(|| format!("Failed to write {} during restore", path))?;
    }
    Ok(())
}

/// Whether a workspace-relative path sits inside a dependency directory.
pub fn is_dependency_path(path: &str) -> bool {
    path.split('/')
        .any(|segment| DEPENDENCY_DIRS.contains(&segment))
}

/// Directory-backed workspace for local runs and tests.
pub struct LocalWorkspace {
    root: PathBuf,
    sandbox_id: String,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let sandbox_id = format!("local-{}", root.display());
        Self { root, sandbox_id }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            bail!("Path escapes the workspace: {}", path);
        }
        Ok(self.root.join(rel))
    }

    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .expect("walked path is under root")
                .to_string_lossy()
                .replace('\\', "/");
            if is_dependency_path(&rel) {
                continue;
            }
            if path.is_dir() {
                Self::walk(&path, root, out)?;
            } else {
                out.push(rel);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceProvider for LocalWorkspace {
    async fn list_files(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            Self::walk(&root, &root, &mut out)?;
            out.sort();
            Ok::<_, anyhow::Error>(out)
        })
        .await??;
        Ok(files)
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("Failed to write {}", full.display()))
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&full).await?,
            Ok(_) => tokio::fs::remove_file(&full).await?,
            Err(_) => {}
        }
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        let output = tokio::process::Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.root)
            .output()
            .await
            .with_context(|| format!("Failed to spawn command: {}", command))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            success: output.status.success(),
        })
    }

    async fn install_packages(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let command = format!("npm install {}", packages.join(" "));
        let output = self.run_command(&command).await?;
        if !output.success {
            bail!("Package install failed: {}", output.stderr);
        }
        Ok(())
    }

    async fn sandbox_info(&self) -> Result<SandboxInfo> {
        Ok(SandboxInfo {
            sandbox_id: self.sandbox_id.clone(),
            preview_url: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dependency_paths_excluded() {
        assert!(is_dependency_path("node_modules/react/index.js"));
        assert!(is_dependency_path("packages/app/node_modules/x.js"));
        assert!(is_dependency_path(".git/HEAD"));
        assert!(!is_dependency_path("src/components/Button.tsx"));
    }

    #[tokio::test]
    async fn test_local_workspace_roundtrip() {
        let dir = tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path());

        ws.write_file("src/App.tsx", "export default 1;").await.unwrap();
        ws.write_file("package.json", "{}").await.unwrap();

        let files = ws.list_files().await.unwrap();
        assert_eq!(files, vec!["package.json", "src/App.tsx"]);
        assert_eq!(ws.read_file("src/App.tsx").await.unwrap(), "export default 1;");
    }

    #[tokio::test]
    async fn test_local_workspace_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path());
        assert!(ws.read_file("../outside.txt").await.is_err());
        assert!(ws.write_file("/etc/hosts", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_list_skips_dependency_dirs() {
        let dir = tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path());
        ws.write_file("src/a.ts", "a").await.unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();

        let files = ws.list_files().await.unwrap();
        assert_eq!(files, vec!["src/a.ts"]);
    }

    #[tokio::test]
    async fn test_capture_and_restore_snapshot() {
        let dir = tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path());
        ws.write_file("a.ts", "original").await.unwrap();
        ws.write_file("b.ts", "keep").await.unwrap();

        let snapshot = capture_snapshot(&ws).await.unwrap();
        assert_eq!(snapshot.len(), 2);

        // Mutate: edit one file, add a stray one
        ws.write_file("a.ts", "mutated").await.unwrap();
        ws.write_file("stray.ts", "should vanish").await.unwrap();

        restore_snapshot(&ws, &snapshot).await.unwrap();
        assert_eq!(ws.read_file("a.ts").await.unwrap(), "original");
        assert_eq!(ws.read_file("b.ts").await.unwrap(), "keep");
        assert!(ws.read_file("stray.ts").await.is_err());
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let dir = tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path());
        let out = ws.run_command("echo hello && exit 0").await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");

        let out = ws.run_command("echo oops >&2; exit 3").await.unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }
}
