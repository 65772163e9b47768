//! Retrieval-augmented context assembly.
//!
//! Turns a chat request into a prompt grounded in the project:
//!
//! | Step | What happens |
//! |------|--------------|
//! | 1 | Find the last user query; without one the messages pass through |
//! | 2 | Classify intent and widen `k` |
//! | 3 | Retrieve `2k` hits: hybrid under a deadline, else BM25, else a project overview |
//! | 4 | Re-rank by `score + trust(path)` from curated knowledge |
//! | 5 | Keep at most two non-touching line ranges per path, up to `k` paths |
//! | 6 | List up to three curated knowledge titles |
//! | 7 | Read snippets around each range, fenced, within the byte budget |
//! | 8 | Inject as a system message or append to the last user message |
//!
//! A budget of 0 keeps the citations and drops every code block.

use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use mycoder_core::chunk::lang_for_path;
use mycoder_core::conversation::{contains_hangul, last_user_query};
use mycoder_core::intent::{classify, Intent};
use mycoder_core::knowledge::{curated_heads, path_trust};
use mycoder_core::models::{ChatMessage, SearchHit};
use mycoder_core::search::Retriever;
use mycoder_core::store::Store;

use crate::config::RagConfig;
use crate::fs_ops::resolve_project_path;
use crate::overview::{project_overview, truncate_chars};

pub const MAX_RANGES_PER_PATH: usize = 2;
pub const MAX_CURATED_HEADS: usize = 3;

const PREAMBLE: &str = "You are a coding assistant working inside this project. \
Answer from the context below and cite files as path:start-end. \
If the context does not cover the question, say so instead of guessing.";
const PREAMBLE_KO: &str = "사용자가 한국어로 질문했습니다. 답변은 한국어로 작성하고, 코드와 파일 경로는 원문 그대로 유지하세요.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectStrategy {
    System,
    AppendUser,
}

impl InjectStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "append_user" => Some(Self::AppendUser),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub budget: usize,
    pub inject: InjectStrategy,
    pub style: String,
    pub debug: bool,
    pub retrieval_timeout: Duration,
    pub avg_line_bytes: usize,
    pub margin_lines: usize,
    pub min_lines: usize,
    pub max_lines: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self::from_config(&RagConfig::default())
    }
}

impl ContextSettings {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            budget: config.budget,
            inject: InjectStrategy::parse(&config.inject_strategy).unwrap_or(InjectStrategy::System),
            style: config.style.clone(),
            debug: config.debug,
            retrieval_timeout: Duration::from_millis(config.retrieval_timeout_ms),
            avg_line_bytes: config.avg_line_bytes.max(1),
            margin_lines: config.margin_lines,
            min_lines: config.min_lines.max(1),
            max_lines: config.max_lines.max(config.min_lines.max(1)),
        }
    }
}

/// Result of one assembly, with the pieces callers may want to log.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub messages: Vec<ChatMessage>,
    pub intent: Option<Intent>,
    pub hits: Vec<SearchHit>,
    pub used_overview: bool,
}

impl Assembly {
    fn passthrough(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            intent: None,
            hits: Vec::new(),
            used_overview: false,
        }
    }
}

pub struct ContextAssembler {
    store: Arc<dyn Store>,
    lexical: Arc<dyn Retriever>,
    hybrid: Option<Arc<dyn Retriever>>,
    settings: ContextSettings,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn Store>, lexical: Arc<dyn Retriever>, settings: ContextSettings) -> Self {
        Self {
            store,
            lexical,
            hybrid: None,
            settings,
        }
    }

    /// Prefer this retriever, falling back to lexical when it is slow or empty.
    pub fn with_hybrid(mut self, hybrid: Arc<dyn Retriever>) -> Self {
        self.hybrid = Some(hybrid);
        self
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    pub async fn assemble(
        &self,
        messages: Vec<ChatMessage>,
        project_id: &str,
        k: usize,
    ) -> Result<Assembly> {
        let Some(query) = last_user_query(&messages).map(str::to_string) else {
            return Ok(Assembly::passthrough(messages));
        };
        let Some(project) = self.store.get_project(project_id).await? else {
            return Ok(Assembly::passthrough(messages));
        };

        let intent = classify(&query);
        let k = intent.adjust_k(k.max(1));

        let hits = self.retrieve(project_id, &query, 2 * k).await;
        if hits.is_empty() {
            let overview = project_overview(self.store.as_ref(), &project, self.settings.budget).await?;
            let mut out = Vec::with_capacity(messages.len() + 1);
            out.push(ChatMessage::system(format!(
                "{}\n\nContext:\n{}",
                self.preamble(&query),
                overview
            )));
            out.extend(messages);
            return Ok(Assembly {
                messages: out,
                intent: Some(intent),
                hits,
                used_overview: true,
            });
        }

        let knowledge = self.store.list_knowledge(project_id, 0.0).await?;
        let ranked = rerank_by_trust(hits, &path_trust(&knowledge));
        let selected = dedup_ranges(ranked, k);

        let root = Path::new(&project.root_path);
        let body = self.render_context(root, &selected).await;
        let block = format!("{}\n\nContext:\n{}", self.preamble(&query), body);
        if self.settings.debug {
            debug!(project = project_id, intent = intent.as_str(), context = %block, "assembled context");
        }

        let heads = curated_heads(&knowledge, MAX_CURATED_HEADS);
        let heads_msg = (!heads.is_empty()).then(|| {
            ChatMessage::system(format!(
                "Curated project knowledge:\n{}",
                heads
                    .iter()
                    .map(|t| format!("- {}", t))
                    .collect::<Vec<_>>()
                    .join("\n")
            ))
        });

        let messages = inject(messages, block, heads_msg, self.settings.inject);
        Ok(Assembly {
            messages,
            intent: Some(intent),
            hits: selected,
            used_overview: false,
        })
    }

    async fn retrieve(&self, project_id: &str, query: &str, k: usize) -> Vec<SearchHit> {
        if let Some(hybrid) = &self.hybrid {
            match tokio::time::timeout(
                self.settings.retrieval_timeout,
                hybrid.retrieve(project_id, query, k),
            )
            .await
            {
                Ok(Ok(hits)) if !hits.is_empty() => return hits,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "hybrid retrieval failed, using lexical"),
                Err(_) => warn!(
                    timeout_ms = self.settings.retrieval_timeout.as_millis() as u64,
                    "retrieval timed out, using lexical"
                ),
            }
        }
        match self.lexical.retrieve(project_id, query, k).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "lexical retrieval failed");
                Vec::new()
            }
        }
    }

    fn preamble(&self, query: &str) -> String {
        let mut p = PREAMBLE.to_string();
        match self.settings.style.as_str() {
            "concise" => p.push_str(" Keep the answer short."),
            "detailed" => p.push_str(" Explain step by step."),
            _ => {}
        }
        if contains_hangul(query) {
            p.push('\n');
            p.push_str(PREAMBLE_KO);
        }
        p
    }

    async fn render_context(&self, root: &Path, hits: &[SearchHit]) -> String {
        let mut out = String::new();
        let mut remaining = self.settings.budget;
        let mut files: HashMap<String, Option<Vec<String>>> = HashMap::new();

        for (i, hit) in hits.iter().enumerate() {
            out.push_str(&citation(i + 1, hit));
            out.push('\n');
            if remaining == 0 || hit.start_line <= 0 {
                continue;
            }
            if !files.contains_key(&hit.path) {
                files.insert(hit.path.clone(), read_lines(root, &hit.path).await);
            }
            let Some(Some(lines)) = files.get(&hit.path) else {
                continue;
            };
            let max_lines = (remaining / self.settings.avg_line_bytes)
                .clamp(self.settings.min_lines, self.settings.max_lines);
            if let Some(block) = snippet_block(
                lines,
                hit,
                self.settings.margin_lines,
                max_lines,
                remaining,
            ) {
                remaining -= block.len();
                out.push_str(&block);
            }
        }
        out
    }
}

fn citation(n: usize, hit: &SearchHit) -> String {
    if hit.start_line > 0 {
        format!("[{}] {}:{}-{}", n, hit.path, hit.start_line, hit.end_line)
    } else {
        format!("[{}] {}", n, hit.path)
    }
}

async fn read_lines(root: &Path, rel: &str) -> Option<Vec<String>> {
    let target = resolve_project_path(root, rel).ok()?;
    let text = tokio::fs::read_to_string(&target.abs).await.ok()?;
    Some(text.lines().map(str::to_string).collect())
}

/// Fenced code for `hit` widened by `margin`, at most `max_lines` long and
/// `budget` bytes including fences. `None` if not even one line fits.
fn snippet_block(
    lines: &[String],
    hit: &SearchHit,
    margin: usize,
    max_lines: usize,
    budget: usize,
) -> Option<String> {
    if lines.is_empty() {
        return None;
    }
    let last = lines.len();
    let start = (hit.start_line.max(1) as usize).saturating_sub(margin).max(1);
    if start > last {
        return None;
    }
    let end = (hit.end_line.max(hit.start_line) as usize + margin)
        .min(last)
        .min(start + max_lines.max(1) - 1);

    let open = format!("```{}\n", fence_lang(&hit.path));
    let close = "```\n";
    let overhead = open.len() + close.len();
    if budget <= overhead {
        return None;
    }

    let mut code = String::new();
    for line in &lines[start - 1..end] {
        if overhead + code.len() + line.len() + 1 > budget {
            break;
        }
        code.push_str(line);
        code.push('\n');
    }
    if code.is_empty() {
        let room = budget - overhead;
        let partial = truncate_chars(&lines[start - 1], room.saturating_sub(1));
        if partial.is_empty() {
            return None;
        }
        code = format!("{}\n", partial);
    }
    Some(format!("{}{}{}", open, code, close))
}

pub fn fence_lang(path: &str) -> String {
    let ext = lang_for_path(path);
    match ext.as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" => "typescript",
        "tsx" => "tsx",
        "md" => "markdown",
        "yml" => "yaml",
        "sh" | "bash" => "bash",
        "kt" => "kotlin",
        "rb" => "ruby",
        "h" => "c",
        "hpp" | "cc" | "cxx" => "cpp",
        _ => return ext,
    }
    .to_string()
}

/// Stable sort by `score + trust(path)`, highest first.
pub fn rerank_by_trust(hits: Vec<SearchHit>, trust: &HashMap<String, f64>) -> Vec<SearchHit> {
    let mut scored: Vec<(f64, SearchHit)> = hits
        .into_iter()
        .map(|h| (h.score + trust.get(&h.path).copied().unwrap_or(0.0), h))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, h)| h).collect()
}

fn touches(a: (i64, i64), b: (i64, i64)) -> bool {
    b.0 <= a.1 + 1 && a.0 <= b.1 + 1
}

/// At most [`MAX_RANGES_PER_PATH`] non-overlapping, non-adjacent ranges
/// per path; stops at the first hit of a new path once `k` paths are in.
pub fn dedup_ranges(hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    let mut ranges: HashMap<String, Vec<(i64, i64)>> = HashMap::new();
    let mut out = Vec::new();
    for hit in hits {
        let range = (hit.start_line, hit.end_line.max(hit.start_line));
        match ranges.get_mut(&hit.path) {
            Some(taken) => {
                if taken.len() >= MAX_RANGES_PER_PATH || taken.iter().any(|r| touches(*r, range)) {
                    continue;
                }
                taken.push(range);
            }
            None => {
                if ranges.len() >= k {
                    break;
                }
                ranges.insert(hit.path.clone(), vec![range]);
            }
        }
        out.push(hit);
    }
    out
}

fn inject(
    mut messages: Vec<ChatMessage>,
    block: String,
    heads: Option<ChatMessage>,
    strategy: InjectStrategy,
) -> Vec<ChatMessage> {
    let last_user = messages.iter().rposition(|m| m.role == "user");
    let mut prefix = Vec::with_capacity(2);
    match (strategy, last_user) {
        (InjectStrategy::AppendUser, Some(i)) => {
            let msg = &mut messages[i];
            msg.content = format!("{}\n\n{}", msg.content, block);
        }
        _ => prefix.push(ChatMessage::system(block)),
    }
    prefix.extend(heads);
    prefix.extend(messages);
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycoder_core::chunk::ChunkOptions;
    use mycoder_core::models::{FileDoc, Knowledge, SourceType};
    use mycoder_core::search::Bm25Retriever;
    use mycoder_core::store::memory::InMemoryStore;

    fn hit(path: &str, score: f64, start: i64, end: i64) -> SearchHit {
        SearchHit {
            path: path.into(),
            score,
            preview: String::new(),
            start_line: start,
            end_line: end,
        }
    }

    async fn indexed(files: &[(&str, &str)]) -> (tempfile::TempDir, Arc<InMemoryStore>, String) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let project = store
            .create_project("p", &tmp.path().to_string_lossy(), &[])
            .await
            .unwrap();
        for (path, content) in files {
            let full = tmp.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&full, content).unwrap();
            let doc = FileDoc {
                path: path.to_string(),
                content: content.to_string(),
                sha: mycoder_core::embedding::sha256_hex(content.as_bytes()),
                lang: lang_for_path(path),
                mtime: "2026-01-01T00:00:00Z".into(),
            };
            store
                .upsert_document(&project.id, &doc, &ChunkOptions::default(), false)
                .await
                .unwrap();
        }
        (tmp, store, project.id)
    }

    fn assembler(store: &Arc<InMemoryStore>, settings: ContextSettings) -> ContextAssembler {
        ContextAssembler::new(
            store.clone(),
            Arc::new(Bm25Retriever::new(store.clone())),
            settings,
        )
    }

    #[test]
    fn dedup_limits_ranges_and_paths() {
        let hits = vec![
            hit("a.rs", 5.0, 1, 10),
            hit("a.rs", 4.0, 11, 20),
            hit("a.rs", 3.5, 40, 50),
            hit("a.rs", 3.4, 60, 70),
            hit("b.rs", 3.0, 1, 5),
            hit("c.rs", 2.0, 1, 5),
        ];
        let out = dedup_ranges(hits, 2);
        let got: Vec<(&str, i64)> = out.iter().map(|h| (h.path.as_str(), h.start_line)).collect();
        assert_eq!(got, vec![("a.rs", 1), ("a.rs", 40), ("b.rs", 1)]);
    }

    #[test]
    fn trust_reorders_stably() {
        let hits = vec![hit("a.go", 1.0, 1, 1), hit("b.go", 1.0, 1, 1), hit("c.go", 1.0, 1, 1)];
        let trust = HashMap::from([("b.go".to_string(), 0.9)]);
        let out = rerank_by_trust(hits, &trust);
        let paths: Vec<&str> = out.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["b.go", "a.go", "c.go"]);
    }

    #[test]
    fn snippet_respects_budget_and_fences() {
        let lines: Vec<String> = (1..=50).map(|i| format!("line {}", i)).collect();
        let h = hit("src/x.rs", 1.0, 10, 12);
        let block = snippet_block(&lines, &h, 2, 80, 10_000).unwrap();
        assert!(block.starts_with("```rust\nline 8\n"));
        assert!(block.ends_with("line 14\n```\n"));

        let tight = snippet_block(&lines, &h, 2, 80, 30).unwrap();
        assert!(tight.len() <= 30);
        assert!(tight.starts_with("```rust\n") && tight.ends_with("```\n"));

        assert!(snippet_block(&lines, &h, 2, 80, 5).is_none());
    }

    #[tokio::test]
    async fn system_injection_with_citations_and_code() {
        let (_tmp, store, pid) = indexed(&[
            ("a.go", "package x\nfunc A() {}\n"),
            ("b.go", "package x\nfunc A() {}\n"),
        ])
        .await;
        let mut k = Knowledge::new(&pid, SourceType::Code, "b is canonical", 0.9);
        k.path_or_url = Some("b.go".into());
        k.title = Some("Use b.go for A".into());
        store.add_knowledge(&k).await.unwrap();

        let out = assembler(&store, ContextSettings::default())
            .assemble(vec![ChatMessage::user("where is func A")], &pid, 4)
            .await
            .unwrap();
        assert!(!out.used_overview);
        assert_eq!(out.messages.len(), 3);
        let ctx = &out.messages[0].content;
        assert!(ctx.contains("Context:"));
        let a = ctx.find("a.go:").unwrap();
        let b = ctx.find("b.go:").unwrap();
        assert!(b < a, "trusted path should come first:\n{}", ctx);
        assert!(ctx.contains("```go\n"));
        assert!(out.messages[1].content.contains("Use b.go for A"));
        assert_eq!(out.messages[2], ChatMessage::user("where is func A"));
    }

    #[tokio::test]
    async fn zero_budget_keeps_only_citations() {
        let (_tmp, store, pid) = indexed(&[("a.go", "package a\nfunc A() {}\n")]).await;
        let settings = ContextSettings {
            budget: 0,
            ..Default::default()
        };
        let out = assembler(&store, settings)
            .assemble(vec![ChatMessage::user("func A")], &pid, 3)
            .await
            .unwrap();
        let ctx = &out.messages[0].content;
        assert!(ctx.contains("[1] a.go:"));
        assert!(!ctx.contains("```"));
    }

    #[tokio::test]
    async fn append_user_and_korean_preamble() {
        let (_tmp, store, pid) = indexed(&[("a.go", "package a\nfunc A() {}\n")]).await;
        let settings = ContextSettings {
            inject: InjectStrategy::AppendUser,
            ..Default::default()
        };
        let out = assembler(&store, settings)
            .assemble(vec![ChatMessage::user("func A 설명")], &pid, 3)
            .await
            .unwrap();
        assert_eq!(out.messages.len(), 1);
        assert!(out.messages[0].content.starts_with("func A 설명\n\n"));
        assert!(out.messages[0].content.contains(PREAMBLE_KO));
        assert_eq!(out.intent, Some(Intent::Explain));
    }

    #[tokio::test]
    async fn no_hits_injects_overview() {
        let (_tmp, store, pid) = indexed(&[("README.md", "Hello RAG\n")]).await;
        let out = assembler(&store, ContextSettings::default())
            .assemble(vec![ChatMessage::user("zebra")], &pid, 3)
            .await
            .unwrap();
        assert!(out.used_overview);
        assert!(out.messages[0].content.contains("Project overview"));
    }

    #[tokio::test]
    async fn without_user_message_passes_through() {
        let (_tmp, store, pid) = indexed(&[]).await;
        let input = vec![ChatMessage::system("be brief")];
        let out = assembler(&store, ContextSettings::default())
            .assemble(input.clone(), &pid, 3)
            .await
            .unwrap();
        assert_eq!(out.messages, input);
        assert!(out.intent.is_none());
    }
}
