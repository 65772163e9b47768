//! Process metrics with Prometheus text and JSON renderings.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `mycoder_projects`, `mycoder_documents`, `mycoder_jobs`, `mycoder_knowledge`, `mycoder_embeddings` | gauge | |
//! | `mycoder_http_requests_total` | counter | `method`, `path`, `status` |
//! | `mycoder_http_request_duration_seconds_{sum,count}` | summary | `method`, `path` |
//! | `mycoder_chat_requests_total`, `mycoder_chat_stream_tokens_total` | counter | |
//! | `mycoder_embed_cache_{hits,misses}_total` | counter | |
//! | `mycoder_build_info` | gauge | `version`, `commit` |
//!
//! HTTP samples are thinned by `metrics.sample_rate`: the n-th request is
//! recorded when `floor((n+1)·r) > floor(n·r)`, which keeps exactly the
//! requested fraction without randomness. Paths are recorded in their
//! normalized form to bound label cardinality.

use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use mycoder_core::models::StoreStats;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn commit() -> &'static str {
    option_env!("MYCODER_COMMIT").unwrap_or("unknown")
}

#[derive(Default)]
struct Inner {
    requests: BTreeMap<(String, String, u16), u64>,
    durations: BTreeMap<(String, String), (f64, u64)>,
    chat_requests: u64,
    chat_tokens: u64,
}

/// Gauges and external counters sampled at render time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub store: StoreStats,
    pub embeddings: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

pub struct Metrics {
    inner: Mutex<Inner>,
    sample_rate: f64,
    seen: AtomicU64,
}

impl Metrics {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sample_rate: sample_rate.clamp(0.0, 1.0),
            seen: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the next HTTP request should be recorded.
    pub fn should_sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        let n = self.seen.fetch_add(1, Ordering::Relaxed) as f64;
        ((n + 1.0) * self.sample_rate).floor() > (n * self.sample_rate).floor()
    }

    pub fn record_request(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        let mut inner = self.lock();
        *inner
            .requests
            .entry((method.to_string(), path.to_string(), status))
            .or_insert(0) += 1;
        let d = inner
            .durations
            .entry((method.to_string(), path.to_string()))
            .or_insert((0.0, 0));
        d.0 += elapsed.as_secs_f64();
        d.1 += 1;
    }

    pub fn inc_chat_requests(&self) {
        self.lock().chat_requests += 1;
    }

    /// Approximate token accounting: `len / 4` per delta, at least 1.
    pub fn add_chat_delta(&self, delta: &str) {
        let tokens = (delta.len() as u64 / 4).max(1);
        self.lock().chat_tokens += tokens;
    }

    pub fn chat_requests(&self) -> u64 {
        self.lock().chat_requests
    }

    pub fn chat_tokens(&self) -> u64 {
        self.lock().chat_tokens
    }

    pub fn render_prometheus(&self, snap: &Snapshot) -> String {
        let inner = self.lock();
        let mut out = String::new();

        for (name, help, value) in [
            ("mycoder_projects", "Number of projects", snap.store.projects),
            ("mycoder_documents", "Number of indexed documents", snap.store.documents),
            ("mycoder_jobs", "Number of index jobs", snap.store.jobs),
            ("mycoder_knowledge", "Number of knowledge items", snap.store.knowledge),
            ("mycoder_embeddings", "Number of stored embeddings", snap.embeddings),
        ] {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        let _ = writeln!(out, "# HELP mycoder_http_requests_total HTTP requests by route and status");
        let _ = writeln!(out, "# TYPE mycoder_http_requests_total counter");
        for ((method, path, status), n) in &inner.requests {
            let _ = writeln!(
                out,
                "mycoder_http_requests_total{{method=\"{}\",path=\"{}\",status=\"{}\"}} {}",
                method, path, status, n
            );
        }

        let _ = writeln!(out, "# HELP mycoder_http_request_duration_seconds HTTP request latency");
        let _ = writeln!(out, "# TYPE mycoder_http_request_duration_seconds summary");
        for ((method, path), (sum, count)) in &inner.durations {
            let _ = writeln!(
                out,
                "mycoder_http_request_duration_seconds_sum{{method=\"{}\",path=\"{}\"}} {:.6}",
                method, path, sum
            );
            let _ = writeln!(
                out,
                "mycoder_http_request_duration_seconds_count{{method=\"{}\",path=\"{}\"}} {}",
                method, path, count
            );
        }

        for (name, help, value) in [
            ("mycoder_chat_requests_total", "Chat requests", inner.chat_requests),
            ("mycoder_chat_stream_tokens_total", "Approximate streamed chat tokens", inner.chat_tokens),
            ("mycoder_embed_cache_hits_total", "Embedding cache hits", snap.cache_hits),
            ("mycoder_embed_cache_misses_total", "Embedding cache misses", snap.cache_misses),
        ] {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        let _ = writeln!(out, "# HELP mycoder_build_info Build information");
        let _ = writeln!(out, "# TYPE mycoder_build_info gauge");
        let _ = writeln!(
            out,
            "mycoder_build_info{{version=\"{}\",commit=\"{}\"}} 1",
            VERSION,
            commit()
        );
        out
    }

    pub fn render_json(&self, snap: &Snapshot) -> serde_json::Value {
        let inner = self.lock();
        let requests: Vec<serde_json::Value> = inner
            .requests
            .iter()
            .map(|((method, path, status), n)| {
                json!({"method": method, "path": path, "status": status, "count": n})
            })
            .collect();
        let durations: Vec<serde_json::Value> = inner
            .durations
            .iter()
            .map(|((method, path), (sum, count))| {
                json!({"method": method, "path": path, "sum": sum, "count": count})
            })
            .collect();
        json!({
            "projects": snap.store.projects,
            "documents": snap.store.documents,
            "jobs": snap.store.jobs,
            "knowledge": snap.store.knowledge,
            "embeddings": snap.embeddings,
            "httpRequests": requests,
            "httpDurations": durations,
            "chatRequests": inner.chat_requests,
            "chatTokens": inner.chat_tokens,
            "embedCache": {"hits": snap.cache_hits, "misses": snap.cache_misses},
            "build": {"version": VERSION, "commit": commit()},
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_keeps_exact_fraction() {
        let m = Metrics::new(0.25);
        let kept = (0..100).filter(|_| m.should_sample()).count();
        assert_eq!(kept, 25);

        assert!(Metrics::new(1.0).should_sample());
        assert!(!Metrics::new(0.0).should_sample());
    }

    #[test]
    fn prometheus_output_has_required_series() {
        let m = Metrics::new(1.0);
        m.record_request("GET", "/healthz", 200, Duration::from_millis(3));
        m.record_request("GET", "/index/jobs/:id", 404, Duration::from_millis(1));
        m.inc_chat_requests();
        m.add_chat_delta("Hello ");
        m.add_chat_delta("world");

        let snap = Snapshot {
            store: StoreStats {
                projects: 2,
                documents: 5,
                jobs: 1,
                knowledge: 0,
            },
            ..Default::default()
        };
        let text = m.render_prometheus(&snap);
        assert!(text.contains("mycoder_projects 2"));
        assert!(text.contains(
            "mycoder_http_requests_total{method=\"GET\",path=\"/healthz\",status=\"200\"} 1"
        ));
        assert!(text.contains("mycoder_http_request_duration_seconds_count{method=\"GET\",path=\"/index/jobs/:id\"} 1"));
        assert!(text.contains("mycoder_chat_requests_total 1"));
        assert!(text.contains("mycoder_chat_stream_tokens_total 2"));
        assert!(text.contains("mycoder_build_info{version="));

        let v = m.render_json(&snap);
        assert_eq!(v["documents"], 5);
        assert_eq!(v["chatTokens"], 2);
    }
}
