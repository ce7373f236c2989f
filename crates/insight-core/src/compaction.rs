//! Conversation compaction
//!
//! When the history sent to the model grows past a token threshold, older
//! messages are condensed into a single summary message that is persisted in
//! the conversation. Later turns start from the latest summary and only
//! replay the messages stored after it.

use tracing::info;

use crate::llm::{LlmClient, LlmRequest, ProviderError};
use crate::models::Message;

/// Content prefix that marks a persisted summary message
pub const SUMMARY_PREFIX: &str = "[CONVERSATION SUMMARY";

pub const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that summarizes technical conversations concisely.";

pub const SUMMARY_INSTRUCTION: &str = "Summarize the following conversation concisely. \
Focus on key decisions, findings, and context that would be important for continuing the conversation. \
Use bullet points. Keep it under 500 words.";

const SUMMARY_MAX_TOKENS: u32 = 2000;

/// Rough characters-per-token ratio for messages without provider counts
const CHARS_PER_TOKEN: f64 = 3.5;

pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as i64
}

pub fn is_summary(message: &Message) -> bool {
    message.text().starts_with(SUMMARY_PREFIX)
}

/// Keep the latest summary and whatever was stored after it.
/// Histories without a summary are returned unchanged.
pub fn reuse_latest_summary(history: Vec<Message>) -> Vec<Message> {
    let Some(pos) = history.iter().rposition(is_summary) else {
        return history;
    };

    let cutoff = history[pos].timestamp;
    let mut kept = Vec::with_capacity(history.len() - pos);
    let mut rest = history.into_iter();
    if let Some(summary) = rest.nth(pos) {
        kept.push(summary);
    }
    kept.extend(rest.filter(|m| m.timestamp > cutoff));
    kept
}

/// Approximate size of a request: provider-reported counts where stored,
/// otherwise a character estimate
pub fn history_tokens(system: &str, messages: &[Message]) -> i64 {
    let stored: i64 = messages
        .iter()
        .map(|m| match (m.input_tokens, m.output_tokens) {
            (None, None) => estimate_tokens(m.text()),
            (input, output) => i64::from(input.unwrap_or(0)) + i64::from(output.unwrap_or(0)),
        })
        .sum();
    estimate_tokens(system) + stored
}

pub fn summary_content(summarized: usize, summary: &str) -> String {
    format!(
        "{} - Previous {} messages condensed]\n\n{}",
        SUMMARY_PREFIX, summarized, summary
    )
}

/// Timestamp for a summary of `old`, placing it just before the first kept message
pub fn summary_timestamp(old: &[Message], recent: &[Message]) -> i64 {
    match (recent.first(), old.last()) {
        (Some(first), _) => first.timestamp - 1,
        (None, Some(last)) => last.timestamp + 1,
        (None, None) => 0,
    }
}

/// Ask the model, without tools, for a summary of `messages`
pub async fn summarize(
    llm: &dyn LlmClient,
    model: &str,
    messages: &[Message],
) -> Result<String, ProviderError> {
    let transcript: String = messages
        .iter()
        .map(|m| format!("{}: {}\n\n", m.role.as_str().to_uppercase(), m.text()))
        .collect();

    let request = LlmRequest {
        model: model.to_string(),
        max_tokens: SUMMARY_MAX_TOKENS,
        system: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
        messages: vec![Message::user(
            "",
            format!("{}\n\n{}", SUMMARY_INSTRUCTION, transcript),
            0,
        )],
        tools: Vec::new(),
    };

    let response = llm.send(request).await?;
    if response.content.trim().is_empty() {
        return Err(ProviderError::Malformed {
            reason: "empty summary".to_string(),
            body: String::new(),
        });
    }

    info!(
        "Summarized {} messages ({} output tokens)",
        messages.len(),
        response.output_tokens
    );
    Ok(response.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_tokens(mut message: Message, input: i32, output: i32) -> Message {
        message.input_tokens = Some(input);
        message.output_tokens = Some(output);
        message
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 3);
    }

    #[test]
    fn test_reuse_latest_summary() {
        let history = vec![
            Message::user("c", "old question", 10),
            Message::user("c", summary_content(3, "first"), 15),
            Message::assistant("c", "old answer", 20),
            Message::user("c", summary_content(5, "second"), 29),
            Message::assistant("c", "recent answer", 30),
            Message::user("c", "latest", 40),
        ];

        let kept = reuse_latest_summary(history);
        let texts: Vec<&str> = kept.iter().map(|m| m.text()).collect();
        assert!(texts[0].contains("second"));
        assert_eq!(&texts[1..], &["recent answer", "latest"]);
    }

    #[test]
    fn test_reuse_without_summary_is_identity() {
        let history = vec![Message::user("c", "hi", 1), Message::assistant("c", "hello", 2)];
        assert_eq!(reuse_latest_summary(history.clone()), history);
    }

    #[test]
    fn test_history_tokens_prefers_stored_counts() {
        let messages = vec![
            Message::user("c", "abcdefg", 1),
            with_tokens(Message::assistant("c", "ignored text", 2), 100, 20),
        ];
        assert_eq!(history_tokens("abc", &messages), 1 + 2 + 120);
    }

    #[test]
    fn test_summary_content_and_timestamp() {
        let content = summary_content(4, "- pump replaced");
        assert!(content.starts_with("[CONVERSATION SUMMARY - Previous 4 messages condensed]"));
        assert!(is_summary(&Message::user("c", content, 1)));

        let old = vec![Message::user("c", "a", 10)];
        let recent = vec![Message::user("c", "b", 20)];
        assert_eq!(summary_timestamp(&old, &recent), 19);
        assert_eq!(summary_timestamp(&old, &[]), 11);
    }
}
