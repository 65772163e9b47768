//! Knowledge curation rules.
//!
//! Each operation reads the project's items through a [`Store`], adjusts
//! trust or deletes, and writes the result back. Pinned items are never
//! decayed or garbage-collected. Time is passed in explicitly so that the
//! rules are deterministic under test.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{Knowledge, SourceType};
use crate::store::Store;

pub const PROMOTE_TRUST: f64 = 0.7;
pub const DEFAULT_MIN_TRUST: f64 = 0.3;
pub const DEFAULT_DECAY_RATE: f64 = 0.05;
pub const DEFAULT_DECAY_AFTER_DAYS: i64 = 14;
/// Knowledge at or above this trust is listed as a curated head.
pub const HEAD_MIN_TRUST: f64 = 0.5;

const VET_LONG_TEXT: usize = 200;
const VET_RECENT_DAYS: i64 = 7;

/// Inputs of a manual promotion.
#[derive(Debug, Clone, Default)]
pub struct Promotion {
    pub title: Option<String>,
    pub text: String,
    pub path_or_url: Option<String>,
    pub commit_sha: Option<String>,
    /// Comma-separated.
    pub files: String,
    /// Comma-separated.
    pub symbols: String,
    pub pin: bool,
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

/// Store a promoted item at trust 0.7.
pub async fn promote(store: &dyn Store, project_id: &str, p: Promotion) -> Result<Knowledge> {
    let source = if p.files.trim().is_empty() && p.symbols.trim().is_empty() {
        SourceType::Doc
    } else {
        SourceType::Code
    };
    let mut item = Knowledge::new(project_id, source, &p.text, PROMOTE_TRUST);
    item.title = non_empty(p.title);
    item.path_or_url = non_empty(p.path_or_url);
    item.commit_sha = non_empty(p.commit_sha);
    item.files = split_csv(&p.files);
    item.symbols = split_csv(&p.symbols);
    item.pinned = p.pin;
    store.add_knowledge(&item).await?;
    Ok(item)
}

/// Indexed paths mentioned verbatim in `text`, in the order of `indexed`.
pub fn mentioned_paths(text: &str, indexed: &[String]) -> Vec<String> {
    indexed
        .iter()
        .filter(|p| !p.is_empty() && text.contains(p.as_str()))
        .cloned()
        .collect()
}

/// Additive trust bonuses; returns how many items were vetted.
pub async fn vet(store: &dyn Store, project_id: &str, now: DateTime<Utc>) -> Result<usize> {
    let items = store.list_knowledge(project_id, 0.0).await?;
    let recent = now - Duration::days(VET_RECENT_DAYS);
    for mut item in items.iter().cloned() {
        let mut bonus = if item.text.chars().count() >= VET_LONG_TEXT {
            0.05
        } else {
            0.02
        };
        if item.pinned {
            bonus += 0.05;
        }
        if item.last_touched() >= recent {
            bonus += 0.03;
        }
        item.set_trust(item.trust_score + bonus);
        item.verified_at = Some(now);
        store.update_knowledge(&item).await?;
    }
    Ok(items.len())
}

/// +0.05 for items whose path is unset or still indexed.
pub async fn reverify(store: &dyn Store, project_id: &str, now: DateTime<Utc>) -> Result<usize> {
    let indexed: HashSet<String> = store
        .list_documents(project_id)
        .await?
        .into_iter()
        .map(|d| d.path)
        .collect();
    let mut n = 0;
    for mut item in store.list_knowledge(project_id, 0.0).await? {
        let still_valid = match item.path_or_url.as_deref() {
            None | Some("") => true,
            Some(p) => indexed.contains(p) || item.source_type == SourceType::Web,
        };
        if !still_valid {
            continue;
        }
        item.set_trust(item.trust_score + 0.05);
        item.verified_at = Some(now);
        store.update_knowledge(&item).await?;
        n += 1;
    }
    Ok(n)
}

/// Lower trust of non-pinned items untouched for `after_days`.
pub async fn decay(
    store: &dyn Store,
    project_id: &str,
    rate: f64,
    after_days: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    let cutoff = now - Duration::days(after_days);
    let mut n = 0;
    for mut item in store.list_knowledge(project_id, 0.0).await? {
        if item.pinned || item.last_touched() > cutoff {
            continue;
        }
        item.set_trust((item.trust_score - rate).max(0.0));
        store.update_knowledge(&item).await?;
        n += 1;
    }
    Ok(n)
}

/// Delete non-pinned items with trust below `min_trust`.
pub async fn gc(store: &dyn Store, project_id: &str, min_trust: f64) -> Result<u64> {
    let doomed: Vec<String> = store
        .list_knowledge(project_id, 0.0)
        .await?
        .into_iter()
        .filter(|k| !k.pinned && k.trust_score < min_trust)
        .map(|k| k.id)
        .collect();
    if doomed.is_empty() {
        return Ok(0);
    }
    store.delete_knowledge(&doomed).await
}

/// Delete non-pinned items whose `tags.ttlUntil` has passed.
pub async fn gc_ttl(store: &dyn Store, project_id: &str, now: DateTime<Utc>) -> Result<u64> {
    let doomed: Vec<String> = store
        .list_knowledge(project_id, 0.0)
        .await?
        .into_iter()
        .filter(|k| !k.pinned && k.ttl_until().map(|t| t < now).unwrap_or(false))
        .map(|k| k.id)
        .collect();
    if doomed.is_empty() {
        return Ok(0);
    }
    store.delete_knowledge(&doomed).await
}

/// Pin (optionally) and raise trust of `ids` to at least `min_trust`.
/// Unknown ids are ignored; returns how many items were updated.
pub async fn approve(store: &dyn Store, ids: &[String], pin: bool, min_trust: f64) -> Result<usize> {
    let mut n = 0;
    for id in ids {
        let Some(mut item) = store.get_knowledge(id).await? else {
            continue;
        };
        if pin {
            item.pinned = true;
        }
        if item.trust_score < min_trust {
            item.set_trust(min_trust);
        }
        store.update_knowledge(&item).await?;
        n += 1;
    }
    Ok(n)
}

/// Non-pinned items below `min_trust`, awaiting approval.
pub async fn pending(store: &dyn Store, project_id: &str, min_trust: f64) -> Result<Vec<Knowledge>> {
    Ok(store
        .list_knowledge(project_id, 0.0)
        .await?
        .into_iter()
        .filter(|k| !k.pinned && k.trust_score < min_trust)
        .collect())
}

/// Maximum trust per `pathOrURL`, used by the re-ranker.
pub fn path_trust(items: &[Knowledge]) -> HashMap<String, f64> {
    let mut out: HashMap<String, f64> = HashMap::new();
    for k in items {
        if let Some(p) = k.path_or_url.as_deref().filter(|p| !p.is_empty()) {
            let e = out.entry(p.to_string()).or_insert(0.0);
            if k.trust_score > *e {
                *e = k.trust_score;
            }
        }
    }
    out
}

/// Titles of up to `limit` trusted items, highest trust first.
pub fn curated_heads(items: &[Knowledge], limit: usize) -> Vec<String> {
    let mut trusted: Vec<&Knowledge> = items
        .iter()
        .filter(|k| k.trust_score >= HEAD_MIN_TRUST)
        .filter(|k| k.title.as_deref().map(|t| !t.trim().is_empty()).unwrap_or(false))
        .collect();
    trusted.sort_by(|a, b| {
        b.trust_score
            .partial_cmp(&a.trust_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    trusted
        .into_iter()
        .take(limit)
        .filter_map(|k| k.title.clone())
        .collect()
}

/// Parameters of one curator pass.
#[derive(Debug, Clone, Copy)]
pub struct CuratorPolicy {
    pub decay_rate: f64,
    pub decay_after_days: i64,
    pub min_trust: f64,
}

impl Default for CuratorPolicy {
    fn default() -> Self {
        Self {
            decay_rate: DEFAULT_DECAY_RATE,
            decay_after_days: DEFAULT_DECAY_AFTER_DAYS,
            min_trust: DEFAULT_MIN_TRUST,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CuratorReport {
    pub decayed: usize,
    pub reverified: usize,
    pub removed: u64,
    pub expired: u64,
}

/// One curator pass: decay, reverify, gc, gc_ttl, in that order.
pub async fn curate(
    store: &dyn Store,
    project_id: &str,
    policy: &CuratorPolicy,
    now: DateTime<Utc>,
) -> Result<CuratorReport> {
    let decayed = decay(
        store,
        project_id,
        policy.decay_rate,
        policy.decay_after_days,
        now,
    )
    .await?;
    let reverified = reverify(store, project_id, now).await?;
    let removed = gc(store, project_id, policy.min_trust).await?;
    let expired = gc_ttl(store, project_id, now).await?;
    Ok(CuratorReport {
        decayed,
        reverified,
        removed,
        expired,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    async fn seeded(trust: f64, pinned: bool) -> (InMemoryStore, Knowledge) {
        let store = InMemoryStore::new();
        let mut k = Knowledge::new("p", SourceType::Doc, "short", trust);
        k.pinned = pinned;
        store.add_knowledge(&k).await.unwrap();
        (store, k)
    }

    #[tokio::test]
    async fn promote_sets_trust_and_splits_csv() {
        let store = InMemoryStore::new();
        let item = promote(
            &store,
            "p",
            Promotion {
                title: Some("Retry loop".into()),
                text: "use backoff".into(),
                files: "a.go, b.go,".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(item.trust_score, PROMOTE_TRUST);
        assert_eq!(item.files, vec!["a.go".to_string(), "b.go".to_string()]);
        assert_eq!(item.source_type, SourceType::Code);
        assert!(store.get_knowledge(&item.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn vet_adds_bonuses_and_clamps() {
        let (store, k) = seeded(0.5, true).await;
        let now = Utc::now();
        assert_eq!(vet(&store, "p", now).await.unwrap(), 1);
        let got = store.get_knowledge(&k.id).await.unwrap().unwrap();
        // short text +0.02, pinned +0.05, recent +0.03
        assert!((got.trust_score - 0.6).abs() < 1e-9);
        assert_eq!(got.verified_at, Some(now));

        let (store, k) = seeded(0.99, true).await;
        vet(&store, "p", Utc::now()).await.unwrap();
        assert_eq!(store.get_knowledge(&k.id).await.unwrap().unwrap().trust_score, 1.0);
    }

    #[tokio::test]
    async fn decay_skips_pinned_and_recent() {
        let (store, k) = seeded(0.5, false).await;
        let later = Utc::now() + Duration::days(20);
        assert_eq!(decay(&store, "p", 0.05, 14, later).await.unwrap(), 1);
        let got = store.get_knowledge(&k.id).await.unwrap().unwrap();
        assert!((got.trust_score - 0.45).abs() < 1e-9);

        assert_eq!(decay(&store, "p", 0.05, 14, Utc::now()).await.unwrap(), 0);

        let (store, _) = seeded(0.5, true).await;
        assert_eq!(decay(&store, "p", 0.05, 14, later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn gc_never_removes_pinned() {
        let store = InMemoryStore::new();
        let mut pinned = Knowledge::new("p", SourceType::Doc, "a", 0.0);
        pinned.pinned = true;
        pinned.tags = Some(serde_json::json!({"ttlUntil": "2000-01-01T00:00:00Z"}));
        let mut expired = Knowledge::new("p", SourceType::Web, "b", 0.9);
        expired.tags = Some(serde_json::json!({"ttlUntil": "2000-01-01T00:00:00Z"}));
        let low = Knowledge::new("p", SourceType::Doc, "c", 0.1);
        for k in [&pinned, &expired, &low] {
            store.add_knowledge(k).await.unwrap();
        }

        assert_eq!(gc(&store, "p", 0.3).await.unwrap(), 1);
        assert_eq!(gc_ttl(&store, "p", Utc::now()).await.unwrap(), 1);
        let left = store.list_knowledge("p", 0.0).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, pinned.id);
    }

    #[tokio::test]
    async fn approve_pins_and_raises_trust() {
        let (store, k) = seeded(0.1, false).await;
        assert_eq!(pending(&store, "p", 0.3).await.unwrap().len(), 1);
        let n = approve(&store, &[k.id.clone(), "missing".into()], true, 0.6)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let got = store.get_knowledge(&k.id).await.unwrap().unwrap();
        assert!(got.pinned);
        assert_eq!(got.trust_score, 0.6);
        assert!(pending(&store, "p", 0.3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reverify_requires_indexed_path() {
        let store = InMemoryStore::new();
        let mut gone = Knowledge::new("p", SourceType::Code, "x", 0.5);
        gone.path_or_url = Some("deleted.go".into());
        let free = Knowledge::new("p", SourceType::Doc, "y", 0.5);
        store.add_knowledge(&gone).await.unwrap();
        store.add_knowledge(&free).await.unwrap();
        assert_eq!(reverify(&store, "p", Utc::now()).await.unwrap(), 1);
        let got = store.get_knowledge(&free.id).await.unwrap().unwrap();
        assert!((got.trust_score - 0.55).abs() < 1e-9);
    }

    #[test]
    fn path_trust_takes_max() {
        let mut a = Knowledge::new("p", SourceType::Code, "x", 0.4);
        a.path_or_url = Some("a.go".into());
        let mut b = a.clone();
        b.trust_score = 0.9;
        let t = path_trust(&[a, b]);
        assert_eq!(t.get("a.go"), Some(&0.9));
    }

    #[test]
    fn mentioned_paths_filters_indexed() {
        let indexed = vec!["src/a.rs".to_string(), "README.md".to_string()];
        let found = mentioned_paths("see src/a.rs for details", &indexed);
        assert_eq!(found, vec!["src/a.rs".to_string()]);
    }

    #[test]
    fn heads_need_title_and_trust() {
        let mut a = Knowledge::new("p", SourceType::Doc, "x", 0.8);
        a.title = Some("A".into());
        let mut b = Knowledge::new("p", SourceType::Doc, "x", 0.2);
        b.title = Some("B".into());
        let c = Knowledge::new("p", SourceType::Doc, "x", 0.9);
        assert_eq!(curated_heads(&[a, b, c], 3), vec!["A".to_string()]);
    }
}
