//! Project file walker.
//!
//! Produces [`FileDoc`]s for every eligible file under a project root.
//!
//! # Walk Strategy
//!
//! 1. If `<root>/.git` exists, list tracked and untracked files with
//!    `git ls-files -z --cached --others --exclude-standard`, which honours
//!    `.gitignore`. Any failure falls back to step 2.
//! 2. Otherwise walk the tree, pruning [`DENY_DIRS`].
//! 3. Drop denylisted extensions, files over `max_file_size`, and binaries
//!    (a NUL byte in the first [`BINARY_SNIFF_BYTES`]).
//! 4. Apply `include` globs (must match one, if any), then `exclude` and
//!    project `ignore` globs (must match none).
//!
//! Paths are project-relative and slash-normalized. Output is sorted by
//! path and capped at `max_files`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use mycoder_core::chunk::lang_for_path;
use mycoder_core::embedding::sha256_hex;
use mycoder_core::models::FileDoc;

pub const DENY_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "vendor",
    "dist",
    "build",
    ".next",
    ".cache",
];

const DENY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "svgz", "tif", "tiff", "zip", "gz", "tgz",
    "bz2", "xz", "7z", "rar", "tar", "jar", "war", "mp3", "mp4", "mov", "avi", "mkv", "wav",
    "flac", "ogg", "webm", "pdf", "woff", "woff2", "ttf", "otf", "eot", "exe", "dll", "so",
    "dylib", "o", "a", "class", "pyc", "wasm", "sqlite", "db",
];

pub const BINARY_SNIFF_BYTES: usize = 8000;

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub max_files: usize,
    pub max_file_size: u64,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_files: 20_000,
            max_file_size: 256 * 1024,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// Walk `root` and return eligible files, sorted by path.
pub fn scan_project(root: &Path, opts: &WalkOptions) -> Result<Vec<FileDoc>> {
    if !root.is_dir() {
        bail!("Project root does not exist: {}", root.display());
    }

    let include_set = if opts.include.is_empty() {
        None
    } else {
        Some(build_globset(&opts.include)?)
    };
    let exclude_set = build_globset(&opts.exclude)?;

    let mut candidates = if root.join(".git").exists() {
        match git_list_files(root) {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, root = %root.display(), "git ls-files failed, walking tree");
                walk_tree(root)
            }
        }
    } else {
        walk_tree(root)
    };
    candidates.sort();
    candidates.dedup();

    let mut docs = Vec::new();
    for rel in candidates {
        if docs.len() >= opts.max_files {
            debug!(max_files = opts.max_files, "file cap reached");
            break;
        }
        if in_denied_dir(&rel) || has_denied_extension(&rel) {
            continue;
        }
        if let Some(ref inc) = include_set {
            if !inc.is_match(&rel) {
                continue;
            }
        }
        if exclude_set.is_match(&rel) {
            continue;
        }
        if let Some(doc) = read_file_doc(root, &rel, opts.max_file_size)? {
            docs.push(doc);
        }
    }
    Ok(docs)
}

fn git_list_files(root: &Path) -> Result<Vec<String>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["ls-files", "-z", "--cached", "--others", "--exclude-standard"])
        .output()
        .context("Failed to run git ls-files")?;
    if !output.status.success() {
        bail!(
            "git ls-files failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output
        .stdout
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| normalize(&String::from_utf8_lossy(s)))
        .collect())
}

fn walk_tree(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && DENY_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|rel| normalize(&rel.to_string_lossy()))
        })
        .collect()
}

fn read_file_doc(root: &Path, rel: &str, max_size: u64) -> Result<Option<FileDoc>> {
    let path = root.join(rel);
    let metadata = match std::fs::metadata(&path) {
        Ok(m) if m.is_file() => m,
        // git may list files deleted from the working tree
        _ => return Ok(None),
    };
    if metadata.len() > max_size {
        return Ok(None);
    }
    let bytes =
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    if is_binary(&bytes) {
        return Ok(None);
    }

    let mtime = metadata
        .modified()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Nanos, true))
        .unwrap_or_default();

    Ok(Some(FileDoc {
        path: rel.to_string(),
        sha: sha256_hex(&bytes),
        content: String::from_utf8_lossy(&bytes).into_owned(),
        lang: lang_for_path(rel),
        mtime,
    }))
}

pub fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_SNIFF_BYTES).any(|b| *b == 0)
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

fn in_denied_dir(rel: &str) -> bool {
    let mut parts: Vec<&str> = rel.split('/').collect();
    parts.pop();
    parts.iter().any(|p| DENY_DIRS.contains(p))
}

fn has_denied_extension(rel: &str) -> bool {
    Path::new(rel)
        .extension()
        .map(|e| DENY_EXTENSIONS.contains(&e.to_string_lossy().to_lowercase().as_str()))
        .unwrap_or(false)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("README.md"), "Hello RAG\nThis project tests search API.").unwrap();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/code.go"), "package x\nfunc A(){}").unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("node_modules/pkg/index.js"), "module.exports = 1").unwrap();
        fs::write(root.join("logo.png"), "not really a png").unwrap();
        fs::write(root.join("blob.dat"), b"abc\0def").unwrap();
        fs::write(root.join("big.txt"), "x".repeat(2048)).unwrap();
        tmp
    }

    fn paths(docs: &[FileDoc]) -> Vec<&str> {
        docs.iter().map(|d| d.path.as_str()).collect()
    }

    #[test]
    fn walks_and_filters() {
        let tmp = fixture();
        let opts = WalkOptions {
            max_file_size: 1024,
            ..Default::default()
        };
        let docs = scan_project(tmp.path(), &opts).unwrap();
        assert_eq!(paths(&docs), vec!["README.md", "sub/code.go"]);

        let go = &docs[1];
        assert_eq!(go.lang, "go");
        assert_eq!(go.sha, sha256_hex(b"package x\nfunc A(){}"));
        assert!(go.mtime.ends_with('Z'));
    }

    #[test]
    fn include_then_exclude() {
        let tmp = fixture();
        let opts = WalkOptions {
            include: vec!["**/*.go".into(), "*.md".into()],
            exclude: vec!["sub/**".into()],
            ..Default::default()
        };
        let docs = scan_project(tmp.path(), &opts).unwrap();
        assert_eq!(paths(&docs), vec!["README.md"]);
    }

    #[test]
    fn caps_file_count() {
        let tmp = fixture();
        let opts = WalkOptions {
            max_files: 1,
            ..Default::default()
        };
        assert_eq!(scan_project(tmp.path(), &opts).unwrap().len(), 1);
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(scan_project(&tmp.path().join("nope"), &WalkOptions::default()).is_err());
    }

    #[test]
    fn binary_sniff() {
        assert!(is_binary(b"a\0b"));
        assert!(!is_binary("plain text".as_bytes()));
    }
}
