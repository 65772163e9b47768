//! Language-aware source chunker.
//!
//! Splits file content into overlapping windows of whitespace-delimited
//! tokens. Before windowing, the text is cut into coarse pieces at natural
//! boundaries so that chunks tend to start at a definition (code) or a
//! heading/paragraph (docs):
//!
//! | Strategy | Languages | Coarse boundaries |
//! |----------|-----------|-------------------|
//! | code | `go`, `ts`, `tsx`, `js`, `jsx`, `py` | lines starting a function/class/type/const/var |
//! | doc | `md`, `txt` | markdown headings; blank lines once ≥ ½ soft cap is buffered |
//! | generic | everything else | none |
//!
//! Each coarse piece is then windowed by `max_tokens`, advancing by
//! `max_tokens × (1 − overlap_ratio)` tokens. Windows never span two coarse
//! pieces. A chunk's text runs from its first token up to the first token of
//! the following window (the first chunk also keeps any leading whitespace),
//! so with no overlap the chunk texts concatenate back to the source.
//! Line ranges are 1-based, inclusive, and measured from the first to the
//! last token of the window.

use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_MAX_TOKENS: usize = 400;
pub const DEFAULT_OVERLAP_RATIO: f64 = 0.10;
const MAX_OVERLAP_RATIO: f64 = 0.5;

/// A chunk before it is assigned a document and id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub text: String,
    pub start_line: i64,
    pub end_line: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkOptions {
    pub max_tokens: usize,
    pub overlap_ratio: f64,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_ratio: DEFAULT_OVERLAP_RATIO,
        }
    }
}

impl ChunkOptions {
    pub fn new(max_tokens: usize, overlap_ratio: f64) -> Self {
        Self {
            max_tokens,
            overlap_ratio,
        }
    }

    fn normalized(&self) -> (usize, f64) {
        let max = if self.max_tokens == 0 {
            DEFAULT_MAX_TOKENS
        } else {
            self.max_tokens
        };
        let overlap = if self.overlap_ratio.is_nan() {
            0.0
        } else {
            self.overlap_ratio.clamp(0.0, MAX_OVERLAP_RATIO)
        };
        (max, overlap)
    }

    /// Number of tokens a window advances by.
    fn step(&self) -> usize {
        let (max, overlap) = self.normalized();
        ((max as f64 * (1.0 - overlap)).ceil() as usize).clamp(1, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Code,
    Doc,
    Generic,
}

fn strategy_for(lang: &str) -> Strategy {
    match lang {
        "go" | "ts" | "tsx" | "js" | "jsx" | "py" => Strategy::Code,
        "md" | "txt" => Strategy::Doc,
        _ => Strategy::Generic,
    }
}

fn code_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:export\s+(?:default\s+)?)?(?:async\s+)?(?:func|function|class|type|const|var|def|interface)\b",
        )
        .expect("static regex")
    })
}

fn doc_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{1,6}\s").expect("static regex"))
}

/// Byte span of one whitespace-delimited token.
#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push(Token { start: s, end: i });
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            start: s,
            end: text.len(),
        });
    }
    tokens
}

/// Maps byte offsets to 1-based line numbers.
struct LineIndex {
    newlines: Vec<usize>,
}

impl LineIndex {
    fn new(text: &str) -> Self {
        Self {
            newlines: text
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i)
                .collect(),
        }
    }

    fn line_of(&self, offset: usize) -> i64 {
        self.newlines.partition_point(|&p| p < offset) as i64 + 1
    }
}

/// Byte offsets of every line start, paired with the line text.
fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0usize;
    text.split_inclusive('\n').map(move |line| {
        let start = offset;
        offset += line.len();
        (start, line.trim_end_matches(['\n', '\r']))
    })
}

fn count_tokens(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Coarse piece boundaries as byte offsets, always starting with 0.
fn coarse_boundaries(text: &str, strategy: Strategy, soft_cap: usize) -> Vec<usize> {
    let mut bounds = vec![0usize];
    match strategy {
        Strategy::Generic => {}
        Strategy::Code => {
            // Merge consecutive definitions until the soft cap would be exceeded.
            let mut buffered = 0usize;
            for (offset, line) in lines_with_offsets(text) {
                if offset > 0 && code_boundary().is_match(line) && buffered > 0 {
                    let upcoming = definition_tokens(text, offset);
                    if buffered + upcoming > soft_cap {
                        bounds.push(offset);
                        buffered = 0;
                    }
                }
                buffered += count_tokens(line);
            }
        }
        Strategy::Doc => {
            let mut buffered = 0usize;
            let mut cut_after_blank = false;
            for (offset, line) in lines_with_offsets(text) {
                if offset > 0 && (cut_after_blank || doc_heading().is_match(line)) && buffered > 0
                {
                    bounds.push(offset);
                    buffered = 0;
                }
                cut_after_blank = false;
                if line.trim().is_empty() {
                    cut_after_blank = buffered * 2 >= soft_cap;
                } else {
                    buffered += count_tokens(line);
                }
            }
        }
    }
    bounds
}

/// Tokens from `offset` up to the next definition line (or end of text).
fn definition_tokens(text: &str, offset: usize) -> usize {
    let mut total = 0usize;
    for (i, (_, line)) in lines_with_offsets(&text[offset..]).enumerate() {
        if i > 0 && code_boundary().is_match(line) {
            break;
        }
        total += count_tokens(line);
    }
    total
}

/// Split `text` into overlapping chunks with line ranges.
///
/// Returns an empty vector for text without any non-whitespace token.
pub fn chunk_source(text: &str, lang: &str, opts: &ChunkOptions) -> Vec<ChunkPiece> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Vec::new();
    }

    let (max_tokens, _) = opts.normalized();
    let step = opts.step();
    let lines = LineIndex::new(text);
    let bounds = coarse_boundaries(text, strategy_for(lang), max_tokens);

    let mut pieces = Vec::new();
    let mut tok_idx = 0usize;
    for (bi, &piece_start) in bounds.iter().enumerate() {
        let piece_end = bounds.get(bi + 1).copied().unwrap_or(text.len());
        while tok_idx < tokens.len() && tokens[tok_idx].start < piece_start {
            tok_idx += 1;
        }
        let first = tok_idx;
        while tok_idx < tokens.len() && tokens[tok_idx].start < piece_end {
            tok_idx += 1;
        }
        let window = Window {
            tokens: &tokens,
            first,
            end: tok_idx,
        };
        window.emit(text, max_tokens, step, &lines, &mut pieces);
    }
    pieces
}

/// Tokens `first..end` of one coarse piece, indexed into the whole file.
struct Window<'a> {
    tokens: &'a [Token],
    first: usize,
    end: usize,
}

impl Window<'_> {
    fn emit(
        &self,
        text: &str,
        max_tokens: usize,
        step: usize,
        lines: &LineIndex,
        out: &mut Vec<ChunkPiece>,
    ) {
        if self.first == self.end {
            return;
        }
        let mut i = self.first;
        loop {
            let j = (i + max_tokens).min(self.end);
            let first_tok = self.tokens[i];
            let last_tok = self.tokens[j - 1];
            let next = if j == self.end { j } else { i + step };
            let text_start = if i == 0 { 0 } else { first_tok.start };
            let text_end = self
                .tokens
                .get(next)
                .map(|t| t.start)
                .unwrap_or(text.len())
                .max(last_tok.end);
            out.push(ChunkPiece {
                text: text[text_start..text_end].to_string(),
                start_line: lines.line_of(first_tok.start),
                end_line: lines.line_of(last_tok.end.saturating_sub(1)),
            });
            if j == self.end {
                break;
            }
            i += step;
        }
    }
}

/// Guess the language tag from a file path's extension.
pub fn lang_for_path(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n)
            .map(|i| format!("w{}", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_source("Hello, world!", "txt", &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 1));
    }

    #[test]
    fn empty_and_blank_text_produce_nothing() {
        assert!(chunk_source("", "md", &ChunkOptions::default()).is_empty());
        assert!(chunk_source("  \n\n\t ", "go", &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn windows_overlap_by_at_most_ratio() {
        let text = words(100);
        let opts = ChunkOptions::new(10, 0.2);
        let chunks = chunk_source(&text, "bin", &opts);
        // step = 8, windows at 0,8,...,88 then 88..98 -> last window reaches 100
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let a: Vec<&str> = pair[0].text.split_whitespace().collect();
            let b: Vec<&str> = pair[1].text.split_whitespace().collect();
            let shared = a.iter().filter(|t| b.contains(t)).count();
            assert!(shared <= 2, "overlap {} exceeds 2 tokens", shared);
        }
        assert!(chunks.last().unwrap().text.ends_with("w99"));
    }

    #[test]
    fn overlap_ratio_is_clamped() {
        let text = words(40);
        let wide = chunk_source(&text, "bin", &ChunkOptions::new(10, 0.9));
        let capped = chunk_source(&text, "bin", &ChunkOptions::new(10, 0.5));
        assert_eq!(wide, capped);
    }

    #[test]
    fn zero_overlap_windows_are_disjoint_and_cover_all_tokens() {
        let text = (0..30)
            .map(|i| format!("line{} a b c", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_source(&text, "bin", &ChunkOptions::new(7, 0.0));
        let rejoined: Vec<String> = chunks
            .iter()
            .flat_map(|c| c.text.split_whitespace().map(str::to_string))
            .collect();
        let original: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        assert_eq!(rejoined, original);
    }

    #[test]
    fn rechunking_is_deterministic() {
        let text = "# A\n\nalpha beta\n\n# B\n\ngamma delta\n";
        let a = chunk_source(text, "md", &ChunkOptions::new(4, 0.0));
        let b = chunk_source(text, "md", &ChunkOptions::new(4, 0.0));
        assert_eq!(a, b);
    }

    fn ranges(chunks: &[ChunkPiece]) -> Vec<(i64, i64)> {
        chunks.iter().map(|c| (c.start_line, c.end_line)).collect()
    }

    fn chunk_concat_chunk(text: &str, lang: &str, max_tokens: usize) {
        let opts = ChunkOptions::new(max_tokens, 0.0);
        let first = chunk_source(text, lang, &opts);
        let joined: String = first.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
        let second = chunk_source(&joined, lang, &opts);
        assert_eq!(first.len(), second.len());
        assert_eq!(ranges(&first), ranges(&second));
    }

    #[test]
    fn chunk_concat_round_trip() {
        chunk_concat_chunk("# A\n\nalpha beta\n\n# B\n\ngamma delta\n", "md", 4);
        chunk_concat_chunk(
            "package x\n\nfunc A() {\n  a b c\n}\n\nfunc B() {\n  d e f\n}\n",
            "go",
            4,
        );
        chunk_concat_chunk("\n\n  lead\nwith blank lines\n\n", "txt", 2);
    }

    #[test]
    fn heading_ranges_skip_blank_separators() {
        let text = "# A\n\nalpha beta\n\n# B\n\ngamma delta\n";
        let chunks = chunk_source(text, "md", &ChunkOptions::new(4, 0.0));
        assert_eq!(ranges(&chunks), vec![(1, 3), (5, 7)]);
        assert_eq!(chunks[0].text, "# A\n\nalpha beta\n\n");
    }

    #[test]
    fn line_ranges_are_monotonic_and_inclusive() {
        let text = (1..=50)
            .map(|i| format!("row {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_source(&text, "txt", &ChunkOptions::new(9, 0.1));
        assert_eq!(chunks[0].start_line, 1);
        for c in &chunks {
            assert!(c.start_line <= c.end_line);
        }
        for pair in chunks.windows(2) {
            assert!(pair[0].start_line <= pair[1].start_line);
            assert!(pair[0].end_line <= pair[1].end_line);
        }
        assert_eq!(chunks.last().unwrap().end_line, 50);
    }

    #[test]
    fn markdown_headings_start_new_chunks() {
        let text = "# Intro\nsome words here\n# Usage\nmore words there\n";
        let chunks = chunk_source(text, "md", &ChunkOptions::new(100, 0.1));
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.starts_with("# Usage"));
        assert_eq!(chunks[1].start_line, 3);
    }

    #[test]
    fn code_definitions_become_boundaries_when_cap_is_reached() {
        let body = words(6);
        let text = format!(
            "package x\n\nfunc A() {{\n  {}\n}}\n\nfunc B() {{\n  {}\n}}\n",
            body, body
        );
        let chunks = chunk_source(&text, "go", &ChunkOptions::new(12, 0.0));
        assert!(chunks.iter().any(|c| c.text.starts_with("func B()")));
    }

    #[test]
    fn code_without_boundaries_falls_back_to_windows() {
        let text = words(25);
        let chunks = chunk_source(&text, "py", &ChunkOptions::new(10, 0.0));
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn lang_from_extension() {
        assert_eq!(lang_for_path("sub/code.go"), "go");
        assert_eq!(lang_for_path("README.MD"), "md");
        assert_eq!(lang_for_path("Makefile"), "");
        assert_eq!(lang_for_path(".gitignore"), "");
    }
}
