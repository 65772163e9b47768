use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use mycoder_core::models::ChatMessage;

use super::error::{ApiJson, AppError};
use super::AppState;
use crate::chat::ChatInput;
use crate::sse::{self, SseEvent, SseWriter};

#[derive(Deserialize, Default)]
pub struct RetrievalOptions {
    k: Option<usize>,
}

#[derive(Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    model: Option<String>,
    #[serde(default)]
    stream: bool,
    temperature: Option<f32>,
    #[serde(rename = "projectID")]
    project_id: Option<String>,
    #[serde(default)]
    retrieval: RetrievalOptions,
    #[serde(rename = "conversationID")]
    conversation_id: Option<String>,
}

/// `POST /chat`
///
/// With `stream: true` the reply is SSE: `token`* then `done`, or `error`
/// then `done`. Failures before the first token (provider not configured,
/// retrieval storage errors) are answered with the JSON envelope instead.
pub async fn chat(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ChatBody>,
) -> Result<Response, AppError> {
    if body.messages.is_empty() {
        return Err(AppError::invalid_request("messages must not be empty"));
    }
    let input = ChatInput {
        messages: body.messages,
        model: body.model,
        temperature: body.temperature,
        project_id: body.project_id.filter(|p| !p.trim().is_empty()),
        k: body.retrieval.k.filter(|k| *k > 0),
        conversation_id: body.conversation_id.filter(|c| !c.trim().is_empty()),
    };

    let session = state.chat.start(input).await?;
    if !body.stream {
        let content = state.chat.collect(session).await?;
        return Ok(Json(json!({ "content": content })).into_response());
    }

    let (writer, rx) = SseWriter::channel(Some(SseEvent::Done));
    let chat = state.chat.clone();
    tokio::spawn(async move {
        chat.pump(session, writer).await;
    });
    Ok(sse::response(rx).into_response())
}
