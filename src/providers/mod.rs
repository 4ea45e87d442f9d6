//! Concrete provider backends.
//!
//! Both backends speak plain HTTP via `reqwest` and implement the
//! [`Embedder`](crate::provider::Embedder) and
//! [`Generator`](crate::provider::Generator) traits:
//!
//! - [`ollama`] — the Ollama native API (`/api/embed`, `/api/chat`).
//! - [`openai_compat`] — any OpenAI-compatible endpoint (OpenAI itself,
//!   LM Studio, vLLM, and other local proxies).
//!
//! Embedding requests retry with exponential backoff on 429/5xx and
//! network errors; other 4xx responses fail immediately.

pub mod ollama;
pub mod openai_compat;

use std::time::Duration;

/// Backoff delay before retry `attempt` (1-based): 1s, 2s, 4s, ... capped.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

/// Whether an HTTP status is worth retrying.
pub(crate) fn retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        // Capped at 2^5.
        assert_eq!(backoff_delay(20), Duration::from_secs(32));
    }

    #[test]
    fn test_retryable_status() {
        assert!(retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!retryable_status(reqwest::StatusCode::BAD_REQUEST));
        assert!(!retryable_status(reqwest::StatusCode::UNAUTHORIZED));
    }
}
