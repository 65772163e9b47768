//! Retrievers and the evaluation harness over the in-memory store.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use mycoder_core::chunk::{lang_for_path, ChunkOptions};
use mycoder_core::embedding::{embedding_id, sha256_hex, QueryEmbedder};
use mycoder_core::models::{EmbeddingRecord, FileDoc};
use mycoder_core::search::{
    evaluate, Bm25Retriever, EvalCase, HybridRetriever, KnnRetriever, Retriever,
};
use mycoder_core::store::memory::{InMemoryStore, InMemoryVectorStore};
use mycoder_core::store::{NoopVectorStore, Store, VectorStore};

const DIM: usize = 64;

/// Bag-of-words feature hashing, enough to make similar texts close.
struct HashEmbedder;

fn embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for tok in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in tok.to_lowercase().bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIM as u64) as usize] += 1.0;
    }
    v
}

#[async_trait]
impl QueryEmbedder for HashEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(embed(text))
    }
}

struct Fixture {
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorStore>,
    project_id: String,
}

async fn fixture(files: &[(&str, &str)]) -> Fixture {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let vectors: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let project = store.create_project("fx", "/tmp/fx", &[]).await.unwrap();

    for (path, content) in files {
        let file = FileDoc {
            path: path.to_string(),
            content: content.to_string(),
            sha: sha256_hex(content.as_bytes()),
            lang: lang_for_path(path),
            mtime: Utc::now().to_rfc3339(),
        };
        let out = store
            .upsert_document(&project.id, &file, &ChunkOptions::default(), false)
            .await
            .unwrap();
        let records: Vec<EmbeddingRecord> = out
            .chunks
            .iter()
            .map(|c| {
                let vector = embed(&c.text);
                EmbeddingRecord {
                    id: embedding_id(&project.id, &out.document_id, &c.id, "hash"),
                    project_id: project.id.clone(),
                    doc_id: out.document_id.clone(),
                    chunk_id: c.id.clone(),
                    provider: "hash".into(),
                    model: "hash".into(),
                    dim: vector.len(),
                    vector,
                    created_at: Utc::now(),
                }
            })
            .collect();
        vectors.upsert(&records).await.unwrap();
    }

    Fixture {
        store,
        vectors,
        project_id: project.id,
    }
}

fn seed() -> Vec<(&'static str, &'static str)> {
    vec![
        ("a", "tokenizer splits whitespace into tokens for the chunker"),
        ("b", "vector store computes cosine similarity over embeddings"),
        ("c", "rate limiter refills token buckets lazily per scope"),
    ]
}

fn cases() -> Vec<EvalCase> {
    vec![
        EvalCase {
            query: "tokenizer chunker".into(),
            truth: vec!["a".into()],
        },
        EvalCase {
            query: "cosine embeddings".into(),
            truth: vec!["b".into()],
        },
        EvalCase {
            query: "rate limiter buckets".into(),
            truth: vec!["c".into()],
        },
    ]
}

#[tokio::test]
async fn hybrid_with_full_alpha_is_perfect_on_seed() {
    let fx = fixture(&seed()).await;
    let lex: Arc<dyn Retriever> = Arc::new(Bm25Retriever::new(fx.store.clone()));
    let knn: Arc<dyn Retriever> = Arc::new(KnnRetriever::new(
        fx.store.clone(),
        fx.vectors.clone(),
        Arc::new(HashEmbedder),
    ));
    let hybrid = HybridRetriever::new(lex, knn, 1.0);

    let report = evaluate(&hybrid, &fx.project_id, &cases()).await.unwrap();
    assert_eq!(report.k_at_5, 1.0);
    assert_eq!(report.k_at_10, 1.0);
    assert_eq!(report.mrr, 1.0);
}

#[tokio::test]
async fn knn_finds_semantic_neighbour() {
    let fx = fixture(&seed()).await;
    let knn = KnnRetriever::new(fx.store.clone(), fx.vectors.clone(), Arc::new(HashEmbedder));
    let hits = knn
        .retrieve(&fx.project_id, "cosine similarity", 3)
        .await
        .unwrap();
    assert_eq!(hits[0].path, "b");
    assert!(hits[0].score > 0.0);
}

#[tokio::test]
async fn zero_alpha_reproduces_bm25_ranking() {
    let fx = fixture(&[
        ("x.md", "search engine search ranking"),
        ("y.md", "search once"),
        ("z.md", "nothing relevant here"),
    ])
    .await;
    let bm25 = Arc::new(Bm25Retriever::new(fx.store.clone()));
    let knn = Arc::new(KnnRetriever::new(
        fx.store.clone(),
        fx.vectors.clone(),
        Arc::new(HashEmbedder),
    ));
    let hybrid = HybridRetriever::new(bm25.clone(), knn, 0.0);

    let lex_paths: Vec<String> = bm25
        .retrieve(&fx.project_id, "search", 10)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.path)
        .collect();
    let fused: Vec<String> = hybrid
        .retrieve(&fx.project_id, "search", 10)
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.path)
        .collect();
    assert_eq!(lex_paths, vec!["x.md".to_string(), "y.md".to_string()]);
    assert_eq!(&fused[..lex_paths.len()], &lex_paths[..]);
}

#[tokio::test]
async fn knn_degrades_to_empty_without_vectors() {
    let fx = fixture(&seed()).await;
    let knn = KnnRetriever::new(fx.store.clone(), Arc::new(NoopVectorStore), Arc::new(HashEmbedder));
    assert!(knn
        .retrieve(&fx.project_id, "tokenizer", 5)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn bm25_respects_project_scope() {
    let fx = fixture(&seed()).await;
    let other = fx.store.create_project("other", "/tmp/o", &[]).await.unwrap();
    let bm25 = Bm25Retriever::new(fx.store.clone());
    assert!(bm25
        .retrieve(&other.id, "tokenizer", 5)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        bm25.retrieve(&fx.project_id, "tokenizer", 5).await.unwrap()[0].path,
        "a"
    );
}
