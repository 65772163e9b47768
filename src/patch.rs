//! Unified diff application with dry-run and rollback.
//!
//! A diff is parsed into per-file hunks, every hunk is located and checked
//! against the current content, and only when all files apply cleanly is
//! anything written. The pre-patch content of each touched file is stored
//! in a [`PatchRecord`] so the patch can be rolled back.
//!
//! Hunks are located at their stated line first, then by scanning forward
//! from the previous hunk. Context and removed lines must match exactly.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use mycoder_core::models::{PatchFile, PatchRecord, Project};
use mycoder_core::store::Store;

use crate::fs_ops::{read_optional, resolve_project_path, FsError, FsPolicy, ProjectPath};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Context(String),
    Add(String),
    Del(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    old_start: usize,
    lines: Vec<Line>,
}

impl Hunk {
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Context(s) | Line::Del(s) => Some(s.as_str()),
                Line::Add(_) => None,
            })
            .collect()
    }

    fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Context(s) | Line::Add(s) => Some(s.as_str()),
                Line::Del(_) => None,
            })
            .collect()
    }
}

/// All hunks for one file. A `None` side is `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn adds(&self) -> usize {
        self.count(|l| matches!(l, Line::Add(_)))
    }

    pub fn dels(&self) -> usize {
        self.count(|l| matches!(l, Line::Del(_)))
    }

    fn count(&self, f: impl Fn(&Line) -> bool) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .filter(|l| f(l))
            .count()
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }
}

fn header_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or_default().trim();
    if raw == "/dev/null" {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}

/// `-12,3` → `(12, 3)`; a missing count means 1.
fn parse_range(raw: &str) -> Option<(usize, usize)> {
    let raw = raw.get(1..)?;
    match raw.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((raw.parse().ok()?, 1)),
    }
}

fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize)> {
    let body = line.strip_prefix("@@ ")?;
    let end = body.find(" @@")?;
    let mut parts = body[..end].split_whitespace();
    let (old_start, old_len) = parse_range(parts.next()?)?;
    let (_, new_len) = parse_range(parts.next()?)?;
    Some((old_start, old_len, new_len))
}

/// Parse a (possibly multi-file) unified diff.
pub fn parse_unified(diff: &str) -> Result<Vec<FilePatch>, FsError> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut files = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(old) = lines[i].strip_prefix("--- ") else {
            i += 1;
            continue;
        };
        let new = lines
            .get(i + 1)
            .and_then(|l| l.strip_prefix("+++ "))
            .ok_or_else(|| FsError::InvalidPatch(format!("missing +++ after line {}", i + 1)))?;
        let mut patch = FilePatch {
            old_path: header_path(old),
            new_path: header_path(new),
            hunks: Vec::new(),
        };
        if patch.old_path.is_none() && patch.new_path.is_none() {
            return Err(FsError::InvalidPatch("both sides are /dev/null".into()));
        }
        i += 2;

        while let Some(line) = lines.get(i).filter(|l| l.starts_with("@@")) {
            let (old_start, mut old_left, mut new_left) = parse_hunk_header(line)
                .ok_or_else(|| FsError::InvalidPatch(format!("bad hunk header: {}", line)))?;
            i += 1;
            let mut hunk = Hunk {
                old_start,
                lines: Vec::new(),
            };
            while old_left > 0 || new_left > 0 {
                let Some(raw) = lines.get(i) else {
                    return Err(FsError::InvalidPatch("truncated hunk".into()));
                };
                i += 1;
                if raw.starts_with('\\') {
                    continue;
                }
                // Some tools drop the space of empty context lines.
                let tag = raw.chars().next().unwrap_or(' ');
                let text = raw.get(1..).unwrap_or_default().to_string();
                match tag {
                    '+' => {
                        new_left = new_left.checked_sub(1).ok_or_else(too_long)?;
                        hunk.lines.push(Line::Add(text));
                    }
                    '-' => {
                        old_left = old_left.checked_sub(1).ok_or_else(too_long)?;
                        hunk.lines.push(Line::Del(text));
                    }
                    ' ' => {
                        old_left = old_left.checked_sub(1).ok_or_else(too_long)?;
                        new_left = new_left.checked_sub(1).ok_or_else(too_long)?;
                        hunk.lines.push(Line::Context(text));
                    }
                    _ => return Err(FsError::InvalidPatch(format!("unexpected line: {}", raw))),
                }
            }
            while lines.get(i).map(|l| l.starts_with('\\')).unwrap_or(false) {
                i += 1;
            }
            patch.hunks.push(hunk);
        }

        if patch.hunks.is_empty() {
            return Err(FsError::InvalidPatch(format!("no hunks for {}", patch.path())));
        }
        files.push(patch);
    }

    if files.is_empty() {
        return Err(FsError::InvalidPatch("no file headers found".into()));
    }
    Ok(files)
}

fn too_long() -> FsError {
    FsError::InvalidPatch("hunk longer than its header".into())
}

fn matches_at(content: &[&str], pos: usize, expected: &[&str]) -> bool {
    pos + expected.len() <= content.len() && content[pos..pos + expected.len()] == *expected
}

/// Apply a file's hunks to `original`, returning the new content.
fn apply_file(patch: &FilePatch, original: &str) -> Result<String, FsError> {
    let content: Vec<&str> = original.lines().collect();
    let mut out: Vec<&str> = Vec::with_capacity(content.len());
    let mut cursor = 0;

    for (n, hunk) in patch.hunks.iter().enumerate() {
        let old = hunk.old_lines();
        // `-0,0` hunks insert before line 1.
        let stated = hunk.old_start.saturating_sub(if old.is_empty() { 0 } else { 1 });
        let pos = if stated >= cursor && matches_at(&content, stated, &old) {
            Some(stated)
        } else {
            (cursor..=content.len()).find(|&p| matches_at(&content, p, &old))
        }
        .ok_or_else(|| FsError::Conflict {
            path: patch.path().to_string(),
            reason: format!("hunk {} does not match near line {}", n + 1, hunk.old_start),
        })?;

        out.extend_from_slice(&content[cursor..pos]);
        out.extend(hunk.new_lines());
        cursor = pos + old.len();
    }
    out.extend_from_slice(&content[cursor..]);

    if out.is_empty() {
        return Ok(String::new());
    }
    let mut text = out.join("\n");
    if original.is_empty() || original.ends_with('\n') {
        text.push('\n');
    }
    Ok(text)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileSummary {
    pub path: String,
    pub add: usize,
    pub del: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchSummary {
    pub ok: bool,
    pub dry_run: bool,
    pub total_add: usize,
    pub total_del: usize,
    pub files: Vec<FileSummary>,
    #[serde(rename = "patchID", skip_serializing_if = "Option::is_none")]
    pub patch_id: Option<String>,
}

struct Planned {
    target: ProjectPath,
    before: Option<String>,
    after: Option<String>,
}

/// Apply `diff` inside `project`. Nothing is written when `dry_run` is set
/// or when any file fails to apply.
pub async fn apply_unified(
    store: &dyn Store,
    project: &Project,
    diff: &str,
    dry_run: bool,
    policy: &FsPolicy,
) -> Result<PatchSummary, FsError> {
    let root = std::path::Path::new(&project.root_path);
    let patches = parse_unified(diff)?;

    let mut plan = Vec::with_capacity(patches.len());
    let mut files = Vec::with_capacity(patches.len());
    for patch in &patches {
        let target = resolve_project_path(root, patch.path())?;
        policy.check(&target.rel)?;
        let before = read_optional(&target).await?;
        if patch.old_path.is_some() && before.is_none() {
            return Err(FsError::NotFound(target.rel.clone()));
        }
        let after = if patch.is_deletion() {
            None
        } else {
            Some(apply_file(patch, before.as_deref().unwrap_or_default())?)
        };
        files.push(FileSummary {
            path: target.rel.clone(),
            add: patch.adds(),
            del: patch.dels(),
        });
        plan.push(Planned {
            target,
            before,
            after,
        });
    }

    let mut summary = PatchSummary {
        ok: true,
        dry_run,
        total_add: files.iter().map(|f| f.add).sum(),
        total_del: files.iter().map(|f| f.del).sum(),
        files,
        patch_id: None,
    };
    if dry_run {
        return Ok(summary);
    }

    for (n, step) in plan.iter().enumerate() {
        if let Err(e) = write_state(&step.target, step.after.as_deref()).await {
            warn!(path = %step.target.rel, error = %e, "patch write failed, restoring");
            for done in &plan[..n] {
                if let Err(e) = write_state(&done.target, done.before.as_deref()).await {
                    warn!(path = %done.target.rel, error = %e, "restore failed");
                }
            }
            return Err(e);
        }
    }

    let record = PatchRecord {
        id: uuid::Uuid::new_v4().to_string(),
        project_id: project.id.clone(),
        files: plan
            .into_iter()
            .map(|p| PatchFile {
                path: p.target.rel,
                backup: p.before,
            })
            .collect(),
        created_at: Utc::now(),
        applied_at: Some(Utc::now()),
        applied: true,
    };
    store.save_patch(&record).await?;
    info!(patch = %record.id, files = record.files.len(), "patch applied");
    summary.patch_id = Some(record.id);
    Ok(summary)
}

/// Write `content`, or remove the file when `None`.
async fn write_state(target: &ProjectPath, content: Option<&str>) -> Result<(), FsError> {
    match content {
        Some(text) => {
            if let Some(parent) = target.abs.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target.abs, text).await?;
        }
        None => match tokio::fs::remove_file(&target.abs).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
    }
    Ok(())
}

/// Restore every file of an applied patch to its recorded backup.
pub async fn rollback(
    store: &dyn Store,
    project: &Project,
    patch_id: &str,
    policy: &FsPolicy,
) -> Result<Vec<String>, FsError> {
    let mut record = store
        .get_patch(patch_id)
        .await?
        .filter(|p| p.project_id == project.id && p.applied)
        .ok_or_else(|| FsError::NotFound(format!("patch backup {}", patch_id)))?;

    let root = std::path::Path::new(&project.root_path);
    let mut restored = Vec::with_capacity(record.files.len());
    for file in &record.files {
        let target = resolve_project_path(root, &file.path)?;
        policy.check(&target.rel)?;
        write_state(&target, file.backup.as_deref()).await?;
        restored.push(target.rel);
    }

    record.applied = false;
    store.save_patch(&record).await?;
    info!(patch = %record.id, files = restored.len(), "patch rolled back");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycoder_core::store::memory::InMemoryStore;

    const DIFF: &str = "\
--- a/hello.txt
+++ b/hello.txt
@@ -1,3 +1,4 @@
 line one
-line two
+line 2
+line 2.5
 line three
";

    async fn setup() -> (tempfile::TempDir, InMemoryStore, Project) {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("hello.txt"), "line one\nline two\nline three\n").unwrap();
        let store = InMemoryStore::new();
        let project = store
            .create_project("p", &tmp.path().to_string_lossy(), &[])
            .await
            .unwrap();
        (tmp, store, project)
    }

    #[test]
    fn parses_headers_and_counts() {
        let files = parse_unified(DIFF).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path(), "hello.txt");
        assert_eq!((files[0].adds(), files[0].dels()), (2, 1));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_unified("hello"), Err(FsError::InvalidPatch(_))));
        assert!(matches!(
            parse_unified("--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n a\n"),
            Err(FsError::InvalidPatch(_))
        ));
    }

    #[test]
    fn applies_with_drifted_line_numbers() {
        let files = parse_unified(DIFF).unwrap();
        let out = apply_file(&files[0], "header\nline one\nline two\nline three\n").unwrap();
        assert_eq!(out, "header\nline one\nline 2\nline 2.5\nline three\n");
    }

    #[test]
    fn mismatched_context_conflicts() {
        let files = parse_unified(DIFF).unwrap();
        assert!(matches!(
            apply_file(&files[0], "something else\n"),
            Err(FsError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let (tmp, store, project) = setup().await;
        let summary = apply_unified(&store, &project, DIFF, true, &FsPolicy::default())
            .await
            .unwrap();
        assert!(summary.ok && summary.dry_run);
        assert_eq!((summary.total_add, summary.total_del), (2, 1));
        assert_eq!(
            summary.files,
            vec![FileSummary {
                path: "hello.txt".into(),
                add: 2,
                del: 1
            }]
        );
        assert!(summary.patch_id.is_none());
        let content = std::fs::read_to_string(tmp.path().join("hello.txt")).unwrap();
        assert_eq!(content, "line one\nline two\nline three\n");
    }

    #[tokio::test]
    async fn apply_then_rollback() {
        let (tmp, store, project) = setup().await;
        let diff = format!(
            "{}--- /dev/null\n+++ b/new/file.md\n@@ -0,0 +1,1 @@\n+created\n",
            DIFF
        );
        let summary = apply_unified(&store, &project, &diff, false, &FsPolicy::default())
            .await
            .unwrap();
        let id = summary.patch_id.unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("hello.txt")).unwrap(),
            "line one\nline 2\nline 2.5\nline three\n"
        );
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("new/file.md")).unwrap(),
            "created\n"
        );

        let restored = rollback(&store, &project, &id, &FsPolicy::default())
            .await
            .unwrap();
        assert_eq!(restored, vec!["hello.txt", "new/file.md"]);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("hello.txt")).unwrap(),
            "line one\nline two\nline three\n"
        );
        assert!(!tmp.path().join("new/file.md").exists());

        assert!(matches!(
            rollback(&store, &project, &id, &FsPolicy::default()).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn escaping_patch_is_refused() {
        let (_tmp, store, project) = setup().await;
        let diff = "--- a/../evil\n+++ b/../evil\n@@ -0,0 +1,1 @@\n+x\n";
        assert!(matches!(
            apply_unified(&store, &project, diff, true, &FsPolicy::default()).await,
            Err(FsError::Escape(_))
        ));
    }
}
