//! Project-confined filesystem operations.
//!
//! Every path is resolved against the project root, normalized, and then
//! re-anchored on the canonical root: `..` that climbs above the root, an
//! absolute path outside it, or a symlink that leads out of it all yield
//! [`FsError::Escape`]. Mutations are additionally checked against the
//! `fs.allow` / `fs.deny` regex policy.

use anyhow::Context;
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::config::FsConfig;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("path escapes project root: {0}")]
    Escape(String),
    #[error("path denied by policy: {0}")]
    Denied(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
    #[error("patch does not apply to {path}: {reason}")]
    Conflict { path: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A path inside a project, both absolute and root-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPath {
    pub abs: PathBuf,
    /// Slash-separated, relative to the canonical root.
    pub rel: String,
}

/// Resolve `path` against `root`, refusing anything outside it.
pub fn resolve_project_path(root: &Path, path: &str) -> Result<ProjectPath, FsError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(FsError::InvalidPath("empty path".into()));
    }
    let root = root.canonicalize().map_err(|e| match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(format!("project root {}", root.display())),
        _ => FsError::Io(e),
    })?;

    let requested = Path::new(trimmed);
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    let normalized = normalize(&joined).ok_or_else(|| FsError::Escape(path.to_string()))?;
    if !normalized.starts_with(&root) {
        return Err(FsError::Escape(path.to_string()));
    }

    // Symlinks along the existing prefix must not lead outside the root.
    let (existing, rest) = split_existing(&normalized);
    let real = existing.canonicalize()?.join(rest);
    if !real.starts_with(&root) {
        return Err(FsError::Escape(path.to_string()));
    }

    let rel = real
        .strip_prefix(&root)
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();
    if rel.is_empty() {
        return Err(FsError::InvalidPath(format!("{} is the project root", path)));
    }
    Ok(ProjectPath { abs: real, rel })
}

/// Lexically collapse `.` and `..`. `None` if `..` climbs past the top.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn split_existing(path: &Path) -> (PathBuf, PathBuf) {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let tail: PathBuf = rest.into_iter().rev().collect();
    (existing, tail)
}

/// Regex policy for mutating operations.
#[derive(Debug, Clone, Default)]
pub struct FsPolicy {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl FsPolicy {
    pub fn from_config(config: &FsConfig) -> anyhow::Result<Self> {
        let compile = |patterns: &[String]| -> anyhow::Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(p).with_context(|| format!("Invalid fs policy regex: {}", p)))
                .collect()
        };
        Ok(Self {
            allow: compile(&config.allow)?,
            deny: compile(&config.deny)?,
        })
    }

    pub fn check(&self, rel: &str) -> Result<(), FsError> {
        if self.deny.iter().any(|r| r.is_match(rel)) {
            return Err(FsError::Denied(rel.to_string()));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|r| r.is_match(rel)) {
            return Err(FsError::Denied(rel.to_string()));
        }
        Ok(())
    }
}

fn not_found(rel: &str) -> impl Fn(std::io::Error) -> FsError + '_ {
    move |e| match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(rel.to_string()),
        _ => FsError::Io(e),
    }
}

pub async fn read_file(root: &Path, path: &str) -> Result<(ProjectPath, String), FsError> {
    let target = resolve_project_path(root, path)?;
    let content = tokio::fs::read_to_string(&target.abs)
        .await
        .map_err(not_found(&target.rel))?;
    Ok((target, content))
}

/// Create or overwrite a file, creating parent directories as needed.
pub async fn write_file(
    root: &Path,
    path: &str,
    content: &str,
    policy: &FsPolicy,
) -> Result<ProjectPath, FsError> {
    let target = resolve_project_path(root, path)?;
    policy.check(&target.rel)?;
    if let Some(parent) = target.abs.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target.abs, content).await?;
    Ok(target)
}

pub async fn delete_file(root: &Path, path: &str, policy: &FsPolicy) -> Result<ProjectPath, FsError> {
    let target = resolve_project_path(root, path)?;
    policy.check(&target.rel)?;
    tokio::fs::remove_file(&target.abs)
        .await
        .map_err(not_found(&target.rel))?;
    Ok(target)
}

/// Current content of a file, or `None` if it does not exist.
pub async fn read_optional(target: &ProjectPath) -> Result<Option<String>, FsError> {
    match tokio::fs::read_to_string(&target.abs).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FsError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        tmp
    }

    #[test]
    fn resolves_inside_root() {
        let tmp = project();
        let p = resolve_project_path(tmp.path(), "src/../src/lib.rs").unwrap();
        assert_eq!(p.rel, "src/lib.rs");
        assert!(p.abs.starts_with(tmp.path().canonicalize().unwrap()));

        let new = resolve_project_path(tmp.path(), "docs/new/file.md").unwrap();
        assert_eq!(new.rel, "docs/new/file.md");
    }

    #[test]
    fn refuses_escapes() {
        let tmp = project();
        for bad in ["../x", "src/../../x", "/etc/passwd"] {
            assert!(
                matches!(resolve_project_path(tmp.path(), bad), Err(FsError::Escape(_))),
                "{} should escape",
                bad
            );
        }
        assert!(matches!(
            resolve_project_path(tmp.path(), ""),
            Err(FsError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn refuses_symlink_escape() {
        let tmp = project();
        let outside = tempfile::TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        assert!(matches!(
            resolve_project_path(tmp.path(), "link/secret"),
            Err(FsError::Escape(_))
        ));
    }

    #[test]
    fn policy_allow_and_deny() {
        let policy = FsPolicy::from_config(&FsConfig {
            allow: vec![r"^src/".into()],
            deny: vec![r"\.lock$".into()],
        })
        .unwrap();
        assert!(policy.check("src/lib.rs").is_ok());
        assert!(matches!(policy.check("README.md"), Err(FsError::Denied(_))));
        assert!(matches!(policy.check("src/Cargo.lock"), Err(FsError::Denied(_))));

        let default = FsPolicy::from_config(&FsConfig::default()).unwrap();
        assert!(default.check(".git/config").is_err());
        assert!(default.check("anything.txt").is_ok());
    }

    #[tokio::test]
    async fn write_read_delete() {
        let tmp = project();
        let policy = FsPolicy::default();
        write_file(tmp.path(), "notes/a.txt", "hello", &policy)
            .await
            .unwrap();
        let (_, content) = read_file(tmp.path(), "notes/a.txt").await.unwrap();
        assert_eq!(content, "hello");

        delete_file(tmp.path(), "notes/a.txt", &policy).await.unwrap();
        assert!(matches!(
            read_file(tmp.path(), "notes/a.txt").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            delete_file(tmp.path(), "notes/a.txt", &policy).await,
            Err(FsError::NotFound(_))
        ));
    }
}
