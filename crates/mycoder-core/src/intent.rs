//! Regex-based query intent classification.
//!
//! The intent only widens the retrieval depth: explanation, editing, and
//! research questions benefit from more context than navigation.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Nav,
    Explain,
    Edit,
    Research,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Nav => "nav",
            Intent::Explain => "explain",
            Intent::Edit => "edit",
            Intent::Research => "research",
            Intent::Unknown => "unknown",
        }
    }

    /// Retrieval depth for this intent given the caller's base `k`.
    pub fn adjust_k(&self, k: usize) -> usize {
        match self {
            Intent::Nav | Intent::Unknown => k,
            Intent::Explain => k.max(7),
            Intent::Edit => k.max(8),
            Intent::Research => k.max(10),
        }
    }
}

struct Patterns {
    edit: Regex,
    research: Regex,
    explain: Regex,
    nav: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        edit: Regex::new(
            r"(?i)\b(fix|change|modify|refactor|implement|add|rename|update|remove|delete|rewrite|patch)\b|수정|고쳐|추가|변경|삭제",
        )
        .expect("static regex"),
        research: Regex::new(
            r"(?i)\b(compare|comparison|research|investigate|alternatives?|trade-?offs?|best practices?|survey)\b|비교|조사|대안",
        )
        .expect("static regex"),
        explain: Regex::new(
            r"(?i)\b(explain|why|how does|how do|what is|what does|describe|understand|meaning)\b|설명|왜|무엇|어떻게",
        )
        .expect("static regex"),
        nav: Regex::new(
            r"(?i)\b(where|find|locate|open|show|list|which file|go to|jump)\b|어디|찾아|위치",
        )
        .expect("static regex"),
    })
}

/// Classify `query`. Edit beats research beats explain beats nav.
pub fn classify(query: &str) -> Intent {
    let p = patterns();
    if p.edit.is_match(query) {
        Intent::Edit
    } else if p.research.is_match(query) {
        Intent::Research
    } else if p.explain.is_match(query) {
        Intent::Explain
    } else if p.nav.is_match(query) {
        Intent::Nav
    } else {
        Intent::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_phrasings() {
        assert_eq!(classify("where is the router defined?"), Intent::Nav);
        assert_eq!(classify("Explain the chunker"), Intent::Explain);
        assert_eq!(classify("fix the retry loop"), Intent::Edit);
        assert_eq!(classify("compare bm25 alternatives"), Intent::Research);
        assert_eq!(classify("hello"), Intent::Unknown);
        assert_eq!(classify("이 함수 설명해줘"), Intent::Explain);
    }

    #[test]
    fn adjusts_depth() {
        assert_eq!(Intent::Nav.adjust_k(5), 5);
        assert_eq!(Intent::Explain.adjust_k(5), 7);
        assert_eq!(Intent::Edit.adjust_k(5), 8);
        assert_eq!(Intent::Research.adjust_k(5), 10);
        assert_eq!(Intent::Research.adjust_k(12), 12);
    }
}
