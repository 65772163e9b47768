//! Token-bucket rate limiting across three scopes.
//!
//! Each request draws one token from the global bucket, the bucket of its
//! normalized path, and the bucket of its client IP. A scope with an RPS of
//! 0 is unlimited. Buckets hold at most `max(1, rps)` tokens and refill
//! lazily on each check; a request is admitted only if every scope has a
//! token, and then all of them are charged.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

const MAX_BUCKETS: usize = 10_000;
const IDLE_EVICT: Duration = Duration::from_secs(300);

/// Collapse id segments so that paths make low-cardinality keys.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    match segments.as_slice() {
        ["", "index", "jobs", _] => "/index/jobs/:id".to_string(),
        ["", "projects", _] => "/projects/:id".to_string(),
        _ if path.is_empty() => "/".to_string(),
        _ => path.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

pub struct RateLimiter {
    global_rps: f64,
    path_rps: f64,
    ip_rps: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            global_rps: config.global_rps.max(0.0),
            path_rps: config.path_rps.max(0.0),
            ip_rps: config.ip_rps.max(0.0),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.global_rps > 0.0 || self.path_rps > 0.0 || self.ip_rps > 0.0
    }

    /// `Ok` if admitted, otherwise the suggested `Retry-After` in seconds.
    pub fn check(&self, path: &str, ip: &str) -> Result<(), u64> {
        self.check_at(path, ip, Instant::now())
    }

    fn check_at(&self, path: &str, ip: &str, now: Instant) -> Result<(), u64> {
        if !self.is_enabled() {
            return Ok(());
        }
        let scopes: Vec<(String, f64)> = [
            ("global".to_string(), self.global_rps),
            (format!("path:{}", normalize_path(path)), self.path_rps),
            (format!("ip:{}", ip), self.ip_rps),
        ]
        .into_iter()
        .filter(|(_, rps)| *rps > 0.0)
        .collect();

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if buckets.len() > MAX_BUCKETS {
            buckets.retain(|_, b| now.duration_since(b.last) < IDLE_EVICT);
        }

        let mut wait: f64 = 0.0;
        for (key, rps) in &scopes {
            let capacity = rps.max(1.0);
            let b = buckets.entry(key.clone()).or_insert(Bucket {
                tokens: capacity,
                last: now,
            });
            let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
            b.tokens = (b.tokens + elapsed * rps).min(capacity);
            b.last = now;
            if b.tokens < 1.0 {
                wait = wait.max((1.0 - b.tokens) / rps);
            }
        }
        if wait > 0.0 {
            return Err((wait.ceil() as u64).max(1));
        }
        for (key, _) in &scopes {
            if let Some(b) = buckets.get_mut(key) {
                b.tokens -= 1.0;
            }
        }
        Ok(())
    }
}
