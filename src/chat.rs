//! Chat orchestration.
//!
//! `context assembly → optional summary → sliding window → provider`.
//!
//! The summary step runs only when enabled and the non-system part of the
//! conversation exceeds the threshold; a failed summary is logged and
//! skipped. Counters: one `chat_requests` per call and roughly `len / 4`
//! tokens per delta.
//!
//! Streaming emits `token*` followed by exactly one `done`; a provider
//! error mid-stream emits `error` and then `done`.

use anyhow::Result;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

use mycoder_core::conversation::{non_system_chars, sliding_window, summary_prompt, with_summary};
use mycoder_core::models::ChatMessage;
use mycoder_core::store::Store;

use crate::chat_provider::{ChatProvider, ChatRequest, DeltaStream};
use crate::config::{RagConfig, RetrievalConfig};
use crate::context::ContextAssembler;
use crate::metrics::Metrics;
use crate::sse::{SseEvent, SseWriter};

const SUMMARY_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, Default)]
pub struct ChatInput {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub project_id: Option<String>,
    pub k: Option<usize>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChatSettings {
    pub summary: bool,
    pub summary_threshold: usize,
    pub window_chars: usize,
    pub default_k: usize,
}

impl ChatSettings {
    pub fn from_config(rag: &RagConfig, retrieval: &RetrievalConfig) -> Self {
        Self {
            summary: rag.summary,
            summary_threshold: rag.summary_threshold,
            window_chars: rag.window_chars,
            default_k: retrieval.default_k.max(1),
        }
    }
}

/// A started completion whose deltas have not been consumed yet.
pub struct ChatSession {
    deltas: DeltaStream,
    conversation_id: Option<String>,
    project_id: Option<String>,
}

pub struct ChatOrchestrator {
    store: Arc<dyn Store>,
    provider: Arc<dyn ChatProvider>,
    assembler: Arc<ContextAssembler>,
    metrics: Arc<Metrics>,
    settings: ChatSettings,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ChatProvider>,
        assembler: Arc<ContextAssembler>,
        metrics: Arc<Metrics>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            store,
            provider,
            assembler,
            metrics,
            settings,
        }
    }

    /// Build the provider request for `input`.
    pub async fn prepare(&self, input: &ChatInput) -> Result<ChatRequest> {
        let mut messages = input.messages.clone();

        if let Some(pid) = input.project_id.as_deref().filter(|p| !p.is_empty()) {
            let k = input.k.unwrap_or(self.settings.default_k);
            messages = self.assembler.assemble(messages, pid, k).await?.messages;
        }

        if self.settings.summary && non_system_chars(&messages) > self.settings.summary_threshold {
            let req = ChatRequest {
                messages: summary_prompt(&messages),
                model: input.model.clone(),
                temperature: Some(SUMMARY_TEMPERATURE),
            };
            match self.provider.complete(req).await {
                Ok(summary) => messages = with_summary(messages, &summary),
                Err(e) => warn!(error = %e, "conversation summary failed"),
            }
        }

        Ok(ChatRequest {
            messages: sliding_window(&messages, self.settings.window_chars),
            model: input.model.clone(),
            temperature: input.temperature,
        })
    }

    /// Count the request, build the prompt, and open the provider stream.
    pub async fn start(&self, input: ChatInput) -> Result<ChatSession> {
        self.metrics.inc_chat_requests();
        let req = self.prepare(&input).await?;
        debug!(
            messages = req.messages.len(),
            provider = self.provider.name(),
            "chat request"
        );
        let deltas = self.provider.stream(req).await?;

        if let Some(cid) = input.conversation_id.as_deref() {
            if let Some(last) = input.messages.iter().rev().find(|m| m.role == "user") {
                self.persist(cid, input.project_id.as_deref(), last).await;
            }
        }
        Ok(ChatSession {
            deltas,
            conversation_id: input.conversation_id,
            project_id: input.project_id,
        })
    }

    /// Drain a session into one string.
    pub async fn collect(&self, mut session: ChatSession) -> Result<String> {
        let mut content = String::new();
        while let Some(delta) = session.deltas.next().await {
            let delta = delta?;
            self.metrics.add_chat_delta(&delta);
            content.push_str(&delta);
        }
        self.finish(session, &content).await;
        Ok(content)
    }

    /// Forward a session to an SSE writer configured with a `done` finish.
    pub async fn pump(&self, mut session: ChatSession, mut writer: SseWriter) {
        let mut content = String::new();
        while let Some(delta) = session.deltas.next().await {
            match delta {
                Ok(delta) => {
                    self.metrics.add_chat_delta(&delta);
                    content.push_str(&delta);
                    if !writer.send(SseEvent::Token(delta)).await {
                        debug!("chat client disconnected");
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "chat stream failed");
                    writer.fail(format!("{:#}", e)).await;
                    return;
                }
            }
        }
        writer.close().await;
        self.finish(session, &content).await;
    }

    async fn finish(&self, session: ChatSession, content: &str) {
        if let Some(cid) = session.conversation_id.as_deref() {
            self.persist(cid, session.project_id.as_deref(), &ChatMessage::assistant(content))
                .await;
        }
    }

    async fn persist(&self, conversation_id: &str, project_id: Option<&str>, message: &ChatMessage) {
        if let Err(e) = self
            .store
            .append_message(conversation_id, project_id, message)
            .await
        {
            warn!(conversation = conversation_id, error = %e, "could not persist chat message");
        }
    }
}
