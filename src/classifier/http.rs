use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::prompt::{build_prompt, parse_reply, SYSTEM_PROMPT};
use super::{ClassificationRequest, ClassifierGateway, ClassifierOutput};
use crate::error::{classify_http_status, PipelineError, PipelineResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClassifierSettings {
    pub api_base_url: String,
    /// Usually supplied through `SCREENTRAIL_API_KEY` rather than the settings file.
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.openai.com".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
            max_tokens: 800,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ChatContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ChatContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions backend.
pub struct HttpClassifier {
    settings: ClassifierSettings,
    client: Client,
}

impl HttpClassifier {
    pub fn new(settings: ClassifierSettings) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| PipelineError::permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { settings, client })
    }

    fn api_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.api_base_url.trim_end_matches('/')
        )
    }

    async fn send(&self, messages: Vec<ChatMessage>) -> PipelineResult<String> {
        let body = ChatRequest {
            model: self.settings.model.clone(),
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: 0.2,
        };

        let response = self
            .client
            .post(self.api_url())
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(classify_http_status(status.as_u16(), detail.trim()));
        }

        let reply: ChatResponse = response.json().await?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| PipelineError::transient("classifier reply had no content"))
    }
}

#[async_trait]
impl ClassifierGateway for HttpClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> PipelineResult<ClassifierOutput> {
        let mut content = vec![ChatContent::Text {
            text: build_prompt(request),
        }];
        if let Some(image) = &request.image {
            content.push(ChatContent::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/png;base64,{}", STANDARD.encode(image)),
                },
            });
        }

        let messages = vec![
            ChatMessage {
                role: "system",
                content: vec![ChatContent::Text {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
            ChatMessage {
                role: "user",
                content,
            },
        ];

        let reply = self.send(messages).await?;
        parse_reply(&reply)
    }

    async fn test_connection(&self) -> PipelineResult<String> {
        let messages = vec![ChatMessage {
            role: "user",
            content: vec![ChatContent::Text {
                text: "Reply with the word ok.".to_string(),
            }],
        }];
        self.send(messages).await?;
        Ok(format!("connected to {}", self.settings.model))
    }
}
