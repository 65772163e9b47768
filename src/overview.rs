//! Project overview used when retrieval finds nothing.
//!
//! Sections, in order: language histogram of indexed documents, the
//! directory tree to depth 2, and the first lines of well-known manifest
//! files. The whole text is capped at `max_bytes`.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use walkdir::WalkDir;

use mycoder_core::models::Project;
use mycoder_core::store::Store;

use crate::connector_fs::DENY_DIRS;

const MANIFESTS: &[&str] = &["README.md", "README", "package.json", "go.mod", "Cargo.toml"];
const EXTRACT_LINES: usize = 12;
const TREE_ENTRIES: usize = 60;

pub async fn project_overview(store: &dyn Store, project: &Project, max_bytes: usize) -> Result<String> {
    let docs = store.list_documents(&project.id).await?;
    let mut langs: BTreeMap<String, usize> = BTreeMap::new();
    for d in &docs {
        let lang = if d.lang.is_empty() { "other" } else { d.lang.as_str() };
        *langs.entry(lang.to_string()).or_insert(0) += 1;
    }
    let mut hist: Vec<(String, usize)> = langs.into_iter().collect();
    hist.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let root = project.root_path.clone();
    let (tree, extracts) =
        tokio::task::spawn_blocking(move || (tree(Path::new(&root)), extracts(Path::new(&root))))
            .await?;

    let mut out = String::new();
    let _ = writeln!(out, "Project overview: {}", project.name);
    let _ = writeln!(out, "\nLanguages ({} files):", docs.len());
    for (lang, n) in &hist {
        let _ = writeln!(out, "- {}: {}", lang, n);
    }
    if !tree.is_empty() {
        let _ = writeln!(out, "\nTree:");
        for line in &tree {
            let _ = writeln!(out, "{}", line);
        }
    }
    for (name, text) in &extracts {
        let _ = writeln!(out, "\n{}:\n{}", name, text);
    }
    Ok(truncate_chars(&out, max_bytes))
}

fn tree(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && DENY_DIRS.contains(&name.as_ref()))
        })
        .filter_map(|e| e.ok())
        .take(TREE_ENTRIES)
        .map(|e| {
            let indent = "  ".repeat(e.depth() - 1);
            let suffix = if e.file_type().is_dir() { "/" } else { "" };
            format!("{}{}{}", indent, e.file_name().to_string_lossy(), suffix)
        })
        .collect()
}

fn extracts(root: &Path) -> Vec<(String, String)> {
    MANIFESTS
        .iter()
        .filter_map(|name| {
            let text = std::fs::read_to_string(root.join(name)).ok()?;
            let head: Vec<&str> = text.lines().take(EXTRACT_LINES).collect();
            Some((name.to_string(), head.join("\n")))
        })
        .collect()
}

/// Longest prefix of `s` within `max` bytes, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
