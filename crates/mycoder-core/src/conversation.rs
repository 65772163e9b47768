//! Pure helpers over chat message lists: last user query, sliding window,
//! and summary prompt construction.

use crate::models::ChatMessage;

pub const DEFAULT_WINDOW_CHARS: usize = 6000;
pub const DEFAULT_SUMMARY_THRESHOLD: usize = 8000;
pub const SUMMARY_MAX_MESSAGES: usize = 6;

/// Content of the most recent non-empty user message.
pub fn last_user_query(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
}

/// True if `text` contains Hangul syllables or jamo.
pub fn contains_hangul(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(c as u32,
            0xAC00..=0xD7A3 | 0x1100..=0x11FF | 0x3130..=0x318F | 0xA960..=0xA97F | 0xD7B0..=0xD7FF)
    })
}

fn char_len(m: &ChatMessage) -> usize {
    m.content.chars().count()
}

/// Total characters across non-system messages.
pub fn non_system_chars(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .filter(|m| !m.is_system())
        .map(char_len)
        .sum()
}

/// Keep every system message, then as many of the most recent other
/// messages as fit in `budget` characters. The latest message is always
/// kept. Chronological order is preserved.
pub fn sliding_window(messages: &[ChatMessage], budget: usize) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = messages.iter().filter(|m| m.is_system()).cloned().collect();
    let rest: Vec<&ChatMessage> = messages.iter().filter(|m| !m.is_system()).collect();

    let mut remaining = budget;
    let mut tail: Vec<ChatMessage> = Vec::new();
    for (i, m) in rest.iter().rev().enumerate() {
        let len = char_len(m);
        if i > 0 && len > remaining {
            break;
        }
        remaining = remaining.saturating_sub(len);
        tail.push((*m).clone());
    }
    tail.reverse();
    out.extend(tail);
    out
}

/// Prompt asking the model to summarize the last few non-system messages.
pub fn summary_prompt(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let recent: Vec<&ChatMessage> = messages.iter().filter(|m| !m.is_system()).collect();
    let start = recent.len().saturating_sub(SUMMARY_MAX_MESSAGES);
    let transcript = recent[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    vec![
        ChatMessage::system(
            "Summarize the conversation below in a few short bullet points. \
             Keep file paths, identifiers, and decisions. Do not invent details.",
        ),
        ChatMessage::user(transcript),
    ]
}

/// Prepend a conversation summary as a system message.
pub fn with_summary(messages: Vec<ChatMessage>, summary: &str) -> Vec<ChatMessage> {
    let summary = summary.trim();
    if summary.is_empty() {
        return messages;
    }
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(ChatMessage::system(format!(
        "Conversation summary:\n{}",
        summary
    )));
    out.extend(messages);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_last_user_message() {
        let msgs = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("  second "),
            ChatMessage::assistant("again"),
        ];
        assert_eq!(last_user_query(&msgs), Some("second"));
        assert_eq!(last_user_query(&[ChatMessage::system("s")]), None);
    }

    #[test]
    fn detects_hangul() {
        assert!(contains_hangul("검색 API"));
        assert!(!contains_hangul("search API"));
    }

    #[test]
    fn window_keeps_system_and_tail() {
        let msgs = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("a".repeat(50)),
            ChatMessage::assistant("b".repeat(50)),
            ChatMessage::user("c".repeat(50)),
        ];
        let out = sliding_window(&msgs, 120);
        let roles: Vec<&str> = out.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "assistant", "user"]);
        assert!(out[2].content.starts_with('c'));
    }

    #[test]
    fn window_always_keeps_latest() {
        let msgs = vec![ChatMessage::user("x".repeat(100))];
        assert_eq!(sliding_window(&msgs, 10).len(), 1);
    }

    #[test]
    fn summary_uses_last_six() {
        let msgs: Vec<ChatMessage> = (0..9).map(|i| ChatMessage::user(format!("m{}", i))).collect();
        let prompt = summary_prompt(&msgs);
        assert_eq!(prompt.len(), 2);
        assert!(!prompt[1].content.contains("m2"));
        assert!(prompt[1].content.contains("m3"));
        assert!(prompt[1].content.contains("m8"));
    }

    #[test]
    fn summary_is_prepended() {
        let out = with_summary(vec![ChatMessage::user("q")], "talked about chunking");
        assert!(out[0].is_system());
        assert!(out[0].content.contains("chunking"));
        assert_eq!(with_summary(vec![ChatMessage::user("q")], " ").len(), 1);
    }
}
