use async_trait::async_trait;
use thiserror::Error;

use crate::formatter::DescriptionRequest;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("Provider returned no content")]
    EmptyResponse,

    #[error("Invalid provider configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// Completion tokens as reported by the provider, when it reports them.
    pub completion_tokens: Option<u32>,
}

/// An external language model that turns a description request into text.
#[async_trait]
pub trait DescriptionProvider: Send + Sync {
    async fn describe(&self, request: &DescriptionRequest) -> Result<Completion, ProviderError>;

    fn name(&self) -> &str;
}

/// Decides which provider failures are rate limits worth backing off for.
/// Everything else is terminal for the task.
pub trait RateLimitPolicy: Send + Sync {
    fn is_rate_limit_error(&self, error: &ProviderError) -> bool;
}

/// OpenAI-style signals: HTTP 429, or a `rate_limit_exceeded` error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiRateLimitPolicy;

impl RateLimitPolicy for OpenAiRateLimitPolicy {
    fn is_rate_limit_error(&self, error: &ProviderError) -> bool {
        match error {
            ProviderError::Http { status, body } => {
                let body = body.to_lowercase();
                *status == 429 || body.contains("rate_limit") || body.contains("rate limit")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_openai_rate_limits() {
        let policy = OpenAiRateLimitPolicy;
        assert!(policy.is_rate_limit_error(&ProviderError::Http {
            status: 429,
            body: String::new()
        }));
        assert!(policy.is_rate_limit_error(&ProviderError::Http {
            status: 400,
            body: r#"{"error":{"code":"rate_limit_exceeded"}}"#.to_string()
        }));
        assert!(!policy.is_rate_limit_error(&ProviderError::Http {
            status: 500,
            body: "upstream failure".to_string()
        }));
        assert!(!policy.is_rate_limit_error(&ProviderError::Timeout));
        assert!(!policy.is_rate_limit_error(&ProviderError::Network("rate limit".to_string())));
    }
}
