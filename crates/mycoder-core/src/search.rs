//! Retrievers: BM25, KNN, and their hybrid fusion, plus an evaluation
//! harness.
//!
//! # Hybrid fusion
//!
//! 1. Run the lexical retriever, then the KNN retriever, each with `k`.
//! 2. Group hits by path, keeping the best individual score per side.
//! 3. `aggregate = 1.0 × lex + α × knn` drives ordering.
//! 4. Each result reports its best individual score and the line range of
//!    the hit that produced it.
//! 5. Ties on the aggregate are broken by path ascending; at most `k`
//!    results are returned.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::QueryEmbedder;
use crate::lexical::{snippet, DEFAULT_PREVIEW_TOKENS};
use crate::models::SearchHit;
use crate::store::{Store, VectorStore};

/// Default weight of the semantic side in hybrid fusion.
pub const DEFAULT_HYBRID_ALPHA: f64 = 0.5;

/// Anything that maps a query to ranked hits within a project.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, project_id: &str, query: &str, k: usize) -> Result<Vec<SearchHit>>;
}

/// Keyword retrieval through the store's lexical index.
pub struct Bm25Retriever {
    store: Arc<dyn Store>,
    preview_tokens: usize,
}

impl Bm25Retriever {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            preview_tokens: DEFAULT_PREVIEW_TOKENS,
        }
    }

    pub fn with_preview_tokens(mut self, tokens: usize) -> Self {
        self.preview_tokens = tokens;
        self
    }
}

#[async_trait]
impl Retriever for Bm25Retriever {
    async fn retrieve(&self, project_id: &str, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let pid = if project_id.is_empty() {
            None
        } else {
            Some(project_id)
        };
        self.store
            .lexical_search(pid, query, k, self.preview_tokens)
            .await
    }
}

/// Semantic retrieval: embed the query, cosine-search the vector store, and
/// resolve chunk locations. Any failure degrades to an empty result.
pub struct KnnRetriever {
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn QueryEmbedder>,
    preview_tokens: usize,
}

impl KnnRetriever {
    pub fn new(
        store: Arc<dyn Store>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn QueryEmbedder>,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            preview_tokens: DEFAULT_PREVIEW_TOKENS,
        }
    }

    async fn try_retrieve(&self, project_id: &str, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let qvec = self.embedder.embed_query(query).await?;
        if qvec.is_empty() {
            return Ok(Vec::new());
        }
        let vhits = self.vectors.search(project_id, &qvec, k).await?;
        if vhits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = vhits.iter().map(|h| h.chunk_id.clone()).collect();
        let locations: HashMap<String, _> = self
            .store
            .chunk_locations(&ids)
            .await?
            .into_iter()
            .map(|loc| (loc.chunk_id.clone(), loc))
            .collect();

        // Chunks deleted since embedding are silently dropped.
        Ok(vhits
            .into_iter()
            .filter_map(|h| {
                let loc = locations.get(&h.chunk_id)?;
                Some(SearchHit {
                    path: loc.path.clone(),
                    score: h.score,
                    preview: snippet(&loc.text, query, self.preview_tokens),
                    start_line: loc.start_line,
                    end_line: loc.end_line,
                })
            })
            .collect())
    }
}

#[async_trait]
impl Retriever for KnnRetriever {
    async fn retrieve(&self, project_id: &str, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .try_retrieve(project_id, query, k)
            .await
            .unwrap_or_default())
    }
}

/// Weighted-sum fusion of a lexical and a semantic retriever.
pub struct HybridRetriever {
    lexical: Arc<dyn Retriever>,
    semantic: Arc<dyn Retriever>,
    alpha: f64,
}

impl HybridRetriever {
    pub fn new(lexical: Arc<dyn Retriever>, semantic: Arc<dyn Retriever>, alpha: f64) -> Self {
        Self {
            lexical,
            semantic,
            alpha: alpha.max(0.0),
        }
    }
}

struct Fused {
    lex: f64,
    knn: f64,
    best: SearchHit,
}

/// Merge lexical and semantic hits by path. Exposed for testing the fusion
/// rule without retrievers.
pub fn fuse(lex: Vec<SearchHit>, knn: Vec<SearchHit>, alpha: f64, k: usize) -> Vec<SearchHit> {
    let mut by_path: HashMap<String, Fused> = HashMap::new();
    for (hit, is_lex) in lex
        .into_iter()
        .map(|h| (h, true))
        .chain(knn.into_iter().map(|h| (h, false)))
    {
        let entry = by_path.entry(hit.path.clone()).or_insert_with(|| Fused {
            lex: 0.0,
            knn: 0.0,
            best: hit.clone(),
        });
        if is_lex {
            entry.lex = entry.lex.max(hit.score);
        } else {
            entry.knn = entry.knn.max(hit.score);
        }
        if hit.score > entry.best.score {
            entry.best = hit;
        }
    }

    let mut fused: Vec<(f64, SearchHit)> = by_path
        .into_values()
        .map(|f| (f.lex + alpha * f.knn, f.best))
        .collect();
    fused.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.path.cmp(&b.1.path))
    });
    fused.truncate(k);
    fused.into_iter().map(|(_, hit)| hit).collect()
}

#[async_trait]
impl Retriever for HybridRetriever {
    async fn retrieve(&self, project_id: &str, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let lex = self.lexical.retrieve(project_id, query, k).await?;
        let knn = self.semantic.retrieve(project_id, query, k).await?;
        Ok(fuse(lex, knn, self.alpha, k))
    }
}

/// One labeled query: any path in `truth` counts as relevant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub query: String,
    pub truth: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EvalReport {
    pub k_at_5: f64,
    pub k_at_10: f64,
    pub mrr: f64,
}

/// Hit rate at 5 and 10 and mean reciprocal rank over `cases`.
///
/// Ranks are counted over distinct paths in retrieval order.
pub async fn evaluate(
    retriever: &dyn Retriever,
    project_id: &str,
    cases: &[EvalCase],
) -> Result<EvalReport> {
    if cases.is_empty() {
        return Ok(EvalReport::default());
    }
    let mut hit5 = 0usize;
    let mut hit10 = 0usize;
    let mut rr_sum = 0.0;

    for case in cases {
        let hits = retriever.retrieve(project_id, &case.query, 10).await?;
        let mut paths: Vec<&str> = Vec::new();
        for h in &hits {
            if !paths.contains(&h.path.as_str()) {
                paths.push(&h.path);
            }
        }
        let rank = paths
            .iter()
            .position(|p| case.truth.iter().any(|t| t == p))
            .map(|i| i + 1);
        if let Some(r) = rank {
            if r <= 5 {
                hit5 += 1;
            }
            if r <= 10 {
                hit10 += 1;
            }
            rr_sum += 1.0 / r as f64;
        }
    }

    let n = cases.len() as f64;
    Ok(EvalReport {
        k_at_5: hit5 as f64 / n,
        k_at_10: hit10 as f64 / n,
        mrr: rr_sum / n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(path: &str, score: f64, start: i64) -> SearchHit {
        SearchHit {
            path: path.into(),
            score,
            preview: String::new(),
            start_line: start,
            end_line: start + 1,
        }
    }

    #[test]
    fn fuse_with_zero_alpha_keeps_lexical_order() {
        let lex = vec![hit("a", 3.0, 1), hit("b", 2.0, 1), hit("c", 1.0, 1)];
        let knn = vec![hit("x", 0.9, 1), hit("y", 0.8, 1)];
        let out = fuse(lex, knn, 0.0, 3);
        let paths: Vec<&str> = out.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
    }

    #[test]
    fn fuse_sums_both_sides() {
        let lex = vec![hit("a", 1.0, 1), hit("b", 1.2, 1)];
        let knn = vec![hit("a", 0.9, 10)];
        let out = fuse(lex, knn, 1.0, 5);
        assert_eq!(out[0].path, "a");
        // Best individual score is reported with its own range.
        assert_eq!(out[0].score, 1.0);
        assert_eq!(out[0].start_line, 1);
    }

    #[test]
    fn fuse_reports_range_of_best_hit() {
        let lex = vec![hit("a", 0.2, 1)];
        let knn = vec![hit("a", 0.9, 40)];
        let out = fuse(lex, knn, 0.5, 5);
        assert_eq!(out[0].start_line, 40);
        assert_eq!(out[0].score, 0.9);
    }

    #[test]
    fn fuse_truncates_to_k() {
        let lex = (0..10).map(|i| hit(&format!("p{}", i), i as f64, 1)).collect();
        assert_eq!(fuse(lex, Vec::new(), 0.5, 4).len(), 4);
    }

    struct Fixed(Vec<SearchHit>);

    #[async_trait]
    impl Retriever for Fixed {
        async fn retrieve(&self, _p: &str, _q: &str, k: usize) -> Result<Vec<SearchHit>> {
            Ok(self.0.iter().take(k).cloned().collect())
        }
    }

    #[tokio::test]
    async fn evaluate_counts_ranks() {
        let r = Fixed(vec![hit("a", 1.0, 1), hit("b", 0.5, 1)]);
        let cases = vec![
            EvalCase {
                query: "q1".into(),
                truth: vec!["a".into()],
            },
            EvalCase {
                query: "q2".into(),
                truth: vec!["b".into()],
            },
            EvalCase {
                query: "q3".into(),
                truth: vec!["missing".into()],
            },
        ];
        let report = evaluate(&r, "p", &cases).await.unwrap();
        assert!((report.k_at_5 - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.mrr - 0.5).abs() < 1e-9);
    }
}
