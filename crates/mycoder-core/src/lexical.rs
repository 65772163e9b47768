//! In-memory BM25 inverted index and snippet extraction.
//!
//! Used by the in-memory store; the SQLite store delegates the same contract
//! to FTS5 (`bm25()` + `snippet()`). Tokenization mirrors FTS5's default
//! `unicode61` tokenizer closely enough for ranking parity: lowercase runs of
//! alphanumeric characters.

use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

pub const HIGHLIGHT_OPEN: &str = "[";
pub const HIGHLIGHT_CLOSE: &str = "]";
pub const ELLIPSIS: &str = " … ";
pub const DEFAULT_PREVIEW_TOKENS: usize = 10;

/// Lowercased alphanumeric terms of a query, deduplicated, in order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for (_, _, term) in term_spans(query) {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// `(start, end, lowercased)` for each alphanumeric run.
fn term_spans(text: &str) -> Vec<(usize, usize, String)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            out.push((s, i, text[s..i].to_lowercase()));
        }
    }
    if let Some(s) = start {
        out.push((s, text.len(), text[s..].to_lowercase()));
    }
    out
}

struct Entry {
    terms: HashMap<String, u32>,
    len: usize,
}

/// BM25 index keyed by `(doc_id, ord)`.
#[derive(Default)]
pub struct LexicalIndex {
    entries: HashMap<(String, i64), Entry>,
    doc_freq: HashMap<String, usize>,
    total_len: usize,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn upsert(&mut self, doc_id: &str, ord: i64, text: &str) {
        self.remove((doc_id.to_string(), ord));
        let mut terms: HashMap<String, u32> = HashMap::new();
        let spans = term_spans(text);
        for (_, _, t) in &spans {
            *terms.entry(t.clone()).or_insert(0) += 1;
        }
        for t in terms.keys() {
            *self.doc_freq.entry(t.clone()).or_insert(0) += 1;
        }
        self.total_len += spans.len();
        self.entries.insert(
            (doc_id.to_string(), ord),
            Entry {
                terms,
                len: spans.len(),
            },
        );
    }

    pub fn delete_by_doc(&mut self, doc_id: &str) {
        let keys: Vec<(String, i64)> = self
            .entries
            .keys()
            .filter(|(d, _)| d == doc_id)
            .cloned()
            .collect();
        for key in keys {
            self.remove(key);
        }
    }

    /// Ordinals indexed for a document, ascending.
    pub fn ords_for(&self, doc_id: &str) -> Vec<i64> {
        let mut ords: Vec<i64> = self
            .entries
            .keys()
            .filter(|(d, _)| d == doc_id)
            .map(|(_, o)| *o)
            .collect();
        ords.sort_unstable();
        ords
    }

    fn remove(&mut self, key: (String, i64)) {
        if let Some(entry) = self.entries.remove(&key) {
            self.total_len -= entry.len;
            for t in entry.terms.keys() {
                if let Some(df) = self.doc_freq.get_mut(t) {
                    *df -= 1;
                    if *df == 0 {
                        self.doc_freq.remove(t);
                    }
                }
            }
        }
    }

    /// BM25 score for every entry matching at least one query term.
    ///
    /// `filter` restricts scoring to accepted document ids; corpus statistics
    /// are still global, matching FTS5 behavior with a join filter.
    pub fn search<F>(&self, query: &str, filter: F) -> Vec<(String, i64, f64)>
    where
        F: Fn(&str) -> bool,
    {
        let terms = query_terms(query);
        if terms.is_empty() || self.entries.is_empty() {
            return Vec::new();
        }
        let n = self.entries.len() as f64;
        let avg_len = (self.total_len as f64 / n).max(1.0);

        let mut out = Vec::new();
        for ((doc_id, ord), entry) in &self.entries {
            if !filter(doc_id) {
                continue;
            }
            let mut score = 0.0;
            for t in &terms {
                let tf = match entry.terms.get(t) {
                    Some(tf) => *tf as f64,
                    None => continue,
                };
                let df = self.doc_freq.get(t).copied().unwrap_or(0) as f64;
                let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                let norm = K1 * (1.0 - B + B * entry.len as f64 / avg_len);
                score += idf * (tf * (K1 + 1.0)) / (tf + norm);
            }
            if score > 0.0 {
                out.push((doc_id.clone(), *ord, score));
            }
        }
        out
    }
}

/// Extract a window of `max_tokens` tokens around the densest cluster of
/// query terms, wrapping matches in `[`/`]` and marking elided text with
/// ` … `.
pub fn snippet(text: &str, query: &str, max_tokens: usize) -> String {
    let spans = term_spans(text);
    if spans.is_empty() {
        return String::new();
    }
    let terms = query_terms(query);
    let window = max_tokens.max(1).min(spans.len());
    let is_hit = |i: usize| terms.contains(&spans[i].2);

    let mut best_start = 0usize;
    let mut best_hits = 0usize;
    let mut first_hit = usize::MAX;
    let mut hits = (0..window).filter(|&i| is_hit(i)).count();
    if hits > 0 {
        best_hits = hits;
        first_hit = (0..window).find(|&i| is_hit(i)).unwrap_or(0);
    }
    for start in 1..=(spans.len() - window) {
        if is_hit(start - 1) {
            hits -= 1;
        }
        if is_hit(start + window - 1) {
            hits += 1;
        }
        if hits > best_hits {
            best_hits = hits;
            best_start = start;
            first_hit = (start..start + window).find(|&i| is_hit(i)).unwrap_or(start);
        }
    }
    // Prefer a little leading context before the first match.
    if best_hits > 0 && first_hit > best_start {
        let lead = (window / 4).min(first_hit - best_start);
        let shift = first_hit - best_start - lead;
        best_start = (best_start + shift).min(spans.len() - window);
    }

    let end_idx = best_start + window;
    let mut out = String::new();
    if best_start > 0 {
        out.push_str(ELLIPSIS.trim_start());
    }
    let mut cursor = spans[best_start].0;
    for (s, e, term) in &spans[best_start..end_idx] {
        out.push_str(&text[cursor..*s]);
        if terms.contains(term) {
            out.push_str(HIGHLIGHT_OPEN);
            out.push_str(&text[*s..*e]);
            out.push_str(HIGHLIGHT_CLOSE);
        } else {
            out.push_str(&text[*s..*e]);
        }
        cursor = *e;
    }
    if end_idx < spans.len() {
        out.push_str(ELLIPSIS.trim_end());
    }
    out
}
