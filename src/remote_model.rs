use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RemoteModelConfig;
use crate::formatter::DescriptionRequest;
use crate::provider::{Completion, DescriptionProvider, ProviderError};

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: ChatMessageContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ChatMessageContent {
    Text(String),
    Mixed(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    completion_tokens: Option<u32>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct RemoteModel {
    config: RemoteModelConfig,
    client: reqwest::Client,
}

impl RemoteModel {
    pub fn new(config: &RemoteModelConfig, api_key: &str) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(30));

        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        default_headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| ProviderError::InvalidConfig(format!("Invalid API key format: {}", e)))?,
        );

        if let Some(additional_headers) = &config.additional_headers {
            for (key, value) in additional_headers {
                default_headers.insert(
                    reqwest::header::HeaderName::from_bytes(key.as_bytes())
                        .map_err(|e| ProviderError::InvalidConfig(format!("Invalid header name '{}': {}", key, e)))?,
                    reqwest::header::HeaderValue::from_str(value).map_err(|e| {
                        ProviderError::InvalidConfig(format!("Invalid header value for '{}': {}", key, e))
                    })?,
                );
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("scene-narrator/", env!("CARGO_PKG_VERSION")))
            .default_headers(default_headers)
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        info!("🌐 Initialized remote model client for: {}", config.model_name);
        info!("🔗 Base URL: {}", config.base_url);
        info!("🖼️ Vision support: {}", config.supports_vision);

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn user_content(&self, request: &DescriptionRequest) -> ChatMessageContent {
        match &request.image_base64 {
            Some(image) if self.config.supports_vision => {
                debug!("🖼️ Including frame in description request");
                ChatMessageContent::Mixed(vec![
                    ContentPart::Text {
                        text: request.prompt.clone(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:image/jpeg;base64,{}", image),
                            detail: Some("low".to_string()),
                        },
                    },
                ])
            }
            Some(_) => {
                warn!("⚠️ Frame provided but model doesn't support vision, using text-only");
                ChatMessageContent::Text(request.prompt.clone())
            }
            None => ChatMessageContent::Text(request.prompt.clone()),
        }
    }
}

#[async_trait]
impl DescriptionProvider for RemoteModel {
    async fn describe(&self, request: &DescriptionRequest) -> Result<Completion, ProviderError> {
        let start_time = std::time::Instant::now();

        let body = ChatCompletionRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: ChatMessageContent::Text(request.system.clone()),
                },
                ChatMessage {
                    role: "user",
                    content: self.user_content(request),
                },
            ],
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let endpoint = self.endpoint();
        debug!("📤 Sending request to: {}", endpoint);

        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(ProviderError::EmptyResponse)?;

        let completion_tokens = completion.usage.and_then(|usage| usage.completion_tokens);

        debug!(
            "✅ Remote model response received in {}ms ({:?} completion tokens)",
            start_time.elapsed().as_millis(),
            completion_tokens
        );

        Ok(Completion { text, completion_tokens })
    }

    fn name(&self) -> &str {
        &self.config.model_name
    }
}
