//! Typed server-sent-event writer.
//!
//! Handlers push [`SseEvent`]s into an [`SseWriter`]; the paired receiver is
//! turned into an axum [`Sse`] response. The writer guarantees a terminal
//! frame: [`SseWriter::close`] emits the configured finish event, and a
//! writer dropped without closing emits an `error` followed by that finish
//! event, so clients always see the stream end deterministically.
//!
//! | Stream | Finish event | Error is terminal |
//! |--------|--------------|-------------------|
//! | index job | none (`completed` is sent explicitly) | yes |
//! | chat | `done` | no, `error` is followed by `done` |

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Job(String),
    Progress { indexed: u64, total: u64 },
    Completed { documents: u64 },
    Token(String),
    Error(String),
    Done,
}

impl SseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SseEvent::Job(_) => "job",
            SseEvent::Progress { .. } => "progress",
            SseEvent::Completed { .. } => "completed",
            SseEvent::Token(_) => "token",
            SseEvent::Error(_) => "error",
            SseEvent::Done => "done",
        }
    }

    pub fn data(&self) -> String {
        match self {
            SseEvent::Job(id) => id.clone(),
            SseEvent::Progress { indexed, total } => {
                json!({"indexed": indexed, "total": total}).to_string()
            }
            SseEvent::Completed { documents } => json!({"documents": documents}).to_string(),
            SseEvent::Token(t) => t.clone(),
            SseEvent::Error(m) => m.clone(),
            SseEvent::Done => String::new(),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SseEvent::Completed { .. } | SseEvent::Done)
    }

    pub fn to_event(&self) -> Event {
        // axum rejects carriage returns in data lines
        let data = self.data().replace("\r\n", "\n").replace('\r', "\n");
        Event::default().event(self.name()).data(data)
    }
}

pub struct SseWriter {
    tx: mpsc::Sender<SseEvent>,
    finish: Option<SseEvent>,
    closed: bool,
}

impl SseWriter {
    /// A writer and the receiving half. `finish` is emitted by [`close`](Self::close).
    pub fn channel(finish: Option<SseEvent>) -> (Self, mpsc::Receiver<SseEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                tx,
                finish,
                closed: false,
            },
            rx,
        )
    }

    /// True once the client went away.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send one frame. Returns false if the stream is already finished or
    /// the client disconnected.
    pub async fn send(&mut self, event: SseEvent) -> bool {
        if self.closed {
            return false;
        }
        if event.is_terminal() {
            self.closed = true;
        }
        self.tx.send(event).await.is_ok()
    }

    /// Emit `error`, then the finish event if one is configured.
    pub async fn fail(&mut self, message: impl Into<String>) {
        if self.closed {
            return;
        }
        let _ = self.tx.send(SseEvent::Error(message.into())).await;
        if let Some(finish) = self.finish.clone() {
            let _ = self.tx.send(finish).await;
        }
        self.closed = true;
    }

    /// Emit the finish event unless a terminal frame was already sent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(finish) = self.finish.clone() {
            let _ = self.tx.send(finish).await;
        }
        self.closed = true;
    }
}

impl Drop for SseWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let _ = self
            .tx
            .try_send(SseEvent::Error("stream ended unexpectedly".into()));
        if let Some(finish) = self.finish.take() {
            let _ = self.tx.try_send(finish);
        }
    }
}

/// Adapt a receiver into a stream of axum events.
pub fn event_stream(
    rx: mpsc::Receiver<SseEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok(event.to_event()), rx))
    })
}

/// An SSE response fed by `rx`.
pub fn response(
    rx: mpsc::Receiver<SseEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send> {
    Sse::new(event_stream(rx)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<SseEvent>) -> Vec<SseEvent> {
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn chat_stream_ends_with_done_once() {
        let (mut w, rx) = SseWriter::channel(Some(SseEvent::Done));
        assert!(w.send(SseEvent::Token("Hello ".into())).await);
        w.close().await;
        assert!(!w.send(SseEvent::Token("late".into())).await);
        w.close().await;
        drop(w);
        assert_eq!(
            drain(rx).await,
            vec![SseEvent::Token("Hello ".into()), SseEvent::Done]
        );
    }

    #[tokio::test]
    async fn chat_error_is_followed_by_done() {
        let (mut w, rx) = SseWriter::channel(Some(SseEvent::Done));
        w.fail("boom").await;
        drop(w);
        assert_eq!(drain(rx).await, vec![SseEvent::Error("boom".into()), SseEvent::Done]);
    }

    #[tokio::test]
    async fn job_error_is_terminal() {
        let (mut w, rx) = SseWriter::channel(None);
        w.send(SseEvent::Job("j1".into())).await;
        w.fail("walk failed").await;
        drop(w);
        assert_eq!(
            drain(rx).await,
            vec![SseEvent::Job("j1".into()), SseEvent::Error("walk failed".into())]
        );
    }

    #[tokio::test]
    async fn drop_without_close_still_terminates() {
        let (w, rx) = SseWriter::channel(Some(SseEvent::Done));
        drop(w);
        let events = drain(rx).await;
        assert_eq!(events.last(), Some(&SseEvent::Done));
        assert!(matches!(events[0], SseEvent::Error(_)));
    }

    #[tokio::test]
    async fn detects_client_disconnect() {
        let (w, rx) = SseWriter::channel(None);
        assert!(!w.is_cancelled());
        drop(rx);
        assert!(w.is_cancelled());
    }

    #[test]
    fn progress_payload_is_json() {
        let e = SseEvent::Progress {
            indexed: 10,
            total: 12,
        };
        assert_eq!(e.name(), "progress");
        let v: serde_json::Value = serde_json::from_str(&e.data()).unwrap();
        assert_eq!(v["indexed"], 10);
        assert_eq!(SseEvent::Completed { documents: 0 }.data(), r#"{"documents":0}"#);
    }
}
