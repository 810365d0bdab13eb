//! OpenRouter transport for the generation oracle.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::models::{Model, Usage};

/// OpenRouter API URL
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_SECS: u64 = 2;
const BACKOFF_MULTIPLIER: u64 = 2;

/// Transport-level oracle failures.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("no API key configured; set OPENROUTER_API_KEY or run 'fhir-forge setup'")]
    MissingApiKey,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("rate limited after {0} retries")]
    RateLimited(u32),
    #[error("model returned an empty completion")]
    EmptyCompletion,
}

/// Response from the model including content and usage stats
#[derive(Debug)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// Extract a retry-after hint from an OpenRouter error body, if present.
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    for word in text_lower[pos..].split_whitespace().skip(1).take(5) {
        if let Ok(secs) = word
            .trim_matches(|c: char| !c.is_numeric())
            .parse::<u64>()
        {
            if secs > 0 && secs < 300 {
                return Some(secs);
            }
        }
    }
    None
}

/// Call the model with a system and user prompt.
/// Includes automatic retry with exponential backoff for rate limits.
pub(crate) async fn call_llm(
    api_key: &str,
    system: &str,
    user: &str,
    model: Model,
) -> Result<LlmResponse, OracleError> {
    let client = reqwest::Client::new();

    let request = ChatRequest {
        model: model.id().to_string(),
        messages: vec![
            Message {
                role: "system".to_string(),
                content: system.to_string(),
            },
            Message {
                role: "user".to_string(),
                content: user.to_string(),
            },
        ],
        max_tokens: model.max_tokens(),
        stream: false,
    };

    let mut retry_count = 0;

    loop {
        let response = client
            .post(OPENROUTER_URL)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            let parsed: ChatResponse =
                serde_json::from_str(&text).map_err(|err| OracleError::Api {
                    status: status.as_u16(),
                    message: format!("unparsable completion payload: {err}"),
                })?;

            let content = parsed
                .choices
                .first()
                .map(|c| c.message.content.clone())
                .unwrap_or_default();
            if content.is_empty() {
                return Err(OracleError::EmptyCompletion);
            }
            if let Some(usage) = &parsed.usage {
                info!(model = model.id(), usage = %usage.summary(), "oracle call complete");
            }
            return Ok(LlmResponse {
                content,
                usage: parsed.usage,
            });
        }

        if status.as_u16() == 429 {
            if retry_count >= MAX_RETRIES {
                return Err(OracleError::RateLimited(retry_count));
            }
            retry_count += 1;
            let backoff = parse_retry_after(&text)
                .unwrap_or(INITIAL_BACKOFF_SECS * BACKOFF_MULTIPLIER.pow(retry_count - 1));
            warn!(
                backoff_secs = backoff,
                attempt = retry_count,
                "rate limited by OpenRouter, backing off"
            );
            tokio::time::sleep(tokio::time::Duration::from_secs(backoff)).await;
            continue;
        }

        let message = match status.as_u16() {
            401 => "invalid API key".to_string(),
            500..=599 => "provider temporarily unavailable".to_string(),
            _ => truncate_str(&text, 200).to_string(),
        };
        return Err(OracleError::Api {
            status: status.as_u16(),
            message,
        });
    }
}

/// Truncate a string for display (Unicode-safe)
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    if s.chars().count() <= max_chars {
        s
    } else {
        let byte_idx = s
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        &s[..byte_idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_extracts_seconds() {
        assert_eq!(parse_retry_after("please retry after 12 seconds"), Some(12));
        assert_eq!(parse_retry_after("no hint here"), None);
    }

    #[test]
    fn test_truncate_str_is_unicode_safe() {
        assert_eq!(truncate_str("héllo wörld", 4), "héll");
        assert_eq!(truncate_str("short", 10), "short");
    }
}
