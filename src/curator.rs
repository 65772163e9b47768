//! Background maintenance loops.
//!
//! - **Curator**: every `curator.interval_secs`, for each project, apply
//!   decay, reverify, gc and TTL gc (see [`mycoder_core::knowledge::curate`]).
//! - **Conversation cleanup**: every `conversations.cleanup_interval_secs`,
//!   delete conversations idle for more than `conversations.ttl_days`.
//!
//! Both are detached tokio tasks; errors are logged and the loop goes on.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mycoder_core::knowledge::{curate, CuratorPolicy, CuratorReport};
use mycoder_core::store::Store;

use crate::config::{ConversationsConfig, CuratorConfig};

pub fn policy_from_config(config: &CuratorConfig) -> CuratorPolicy {
    CuratorPolicy {
        decay_rate: config.decay_rate,
        decay_after_days: config.decay_after_days,
        min_trust: config.min_trust,
    }
}

/// One curator pass over every project; reports are summed.
pub async fn curate_all(
    store: &dyn Store,
    policy: &CuratorPolicy,
    now: DateTime<Utc>,
) -> Result<CuratorReport> {
    let mut total = CuratorReport::default();
    for project in store.list_projects().await? {
        let r = curate(store, &project.id, policy, now).await?;
        total.decayed += r.decayed;
        total.reverified += r.reverified;
        total.removed += r.removed;
        total.expired += r.expired;
    }
    Ok(total)
}

/// Start the curator loop unless disabled.
pub fn spawn_curator(store: Arc<dyn Store>, config: &CuratorConfig) -> Option<JoinHandle<()>> {
    if config.disable || config.interval_secs == 0 {
        info!("knowledge curator disabled");
        return None;
    }
    let policy = policy_from_config(config);
    let period = Duration::from_secs(config.interval_secs);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match curate_all(store.as_ref(), &policy, Utc::now()).await {
                Ok(r) => debug!(
                    decayed = r.decayed,
                    reverified = r.reverified,
                    removed = r.removed,
                    expired = r.expired,
                    "curator pass"
                ),
                Err(e) => warn!(error = %e, "curator pass failed"),
            }
        }
    }))
}

/// Delete conversations idle longer than `ttl_days`. 0 keeps everything.
pub async fn cleanup_conversations(
    store: &dyn Store,
    ttl_days: u32,
    now: DateTime<Utc>,
) -> Result<u64> {
    if ttl_days == 0 {
        return Ok(0);
    }
    store
        .delete_conversations_before(now - ChronoDuration::days(ttl_days as i64))
        .await
}

pub fn spawn_conversation_cleanup(
    store: Arc<dyn Store>,
    config: &ConversationsConfig,
) -> Option<JoinHandle<()>> {
    if config.ttl_days == 0 || config.cleanup_interval_secs == 0 {
        return None;
    }
    let ttl_days = config.ttl_days;
    let period = Duration::from_secs(config.cleanup_interval_secs);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match cleanup_conversations(store.as_ref(), ttl_days, Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!(deleted = n, "expired conversations removed"),
                Err(e) => warn!(error = %e, "conversation cleanup failed"),
            }
        }
    }))
}
