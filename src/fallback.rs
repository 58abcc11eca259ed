//! Canned replies used when the upstream runtime cannot answer.

use crate::relay::Completion;
use chrono::Utc;

const KEYWORD_REPLIES: [(&str, &str); 5] = [
    (
        "hello",
        "Hello! I'm a fallback response since the LLM service is currently unavailable.",
    ),
    (
        "what",
        "I'm sorry, I cannot provide a detailed answer right now as the LLM service is unavailable. This is a fallback response.",
    ),
    (
        "how",
        "I'd love to help explain that, but the LLM service is currently unavailable. This is a fallback response.",
    ),
    (
        "why",
        "That's an interesting question! Unfortunately, the LLM service is unavailable right now, so this is a fallback response.",
    ),
    (
        "explain",
        "I'd be happy to explain that topic, but the LLM service is currently unavailable. This is a fallback response.",
    ),
];

const DEFAULT_REPLY: &str =
    "I apologize, but the LLM service is currently unavailable. This is a fallback response to your prompt.";

/// First keyword (in table order) found anywhere in the lower-cased prompt wins.
pub fn fallback_text(prompt: &str) -> &'static str {
    let lower = prompt.to_lowercase();
    KEYWORD_REPLIES
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, reply)| *reply)
        .unwrap_or(DEFAULT_REPLY)
}

pub fn fallback_model(model: &str) -> String {
    format!("{model} (fallback)")
}

pub fn fallback_completion(prompt: &str, model: &str, reason: String) -> Completion {
    tracing::info!(%model, %reason, "using fallback response");
    Completion {
        response: fallback_text(prompt).to_string(),
        model: fallback_model(model),
        timestamp: Utc::now(),
        duration_ms: 0,
        success: false,
        error_reason: Some(reason),
    }
}
