//! Ollama chat API provider.

use super::{InvocationRequest, ModelInvoker};
use crate::error::InvocationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Connection settings for an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub ollama_url: String,
    pub system_prompt: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'a str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    num_predict: usize,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Model invoker backed by Ollama's `/api/chat` endpoint.
pub struct OllamaInvoker {
    config: OllamaConfig,
    http_client: reqwest::Client,
}

impl OllamaInvoker {
    /// Create an invoker. Timeouts are applied per request by the orchestrator.
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    fn map_send_error(&self, e: reqwest::Error, request: &InvocationRequest) -> InvocationError {
        if e.is_timeout() {
            InvocationError::Timeout {
                after: request.timeout,
            }
        } else if e.is_connect() {
            InvocationError::Transport(format!(
                "Cannot connect to Ollama at {}. Is Ollama running?",
                self.config.ollama_url
            ))
        } else {
            InvocationError::Transport(format!("Failed to send request: {}", e))
        }
    }
}

#[async_trait]
impl ModelInvoker for OllamaInvoker {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<String, InvocationError> {
        let url = format!("{}/api/chat", self.config.ollama_url.trim_end_matches('/'));

        let body = OllamaChatRequest {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.config.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                },
            ],
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_output_tokens,
            },
        };

        debug!(
            model = %request.model,
            prompt_chars = request.prompt.len(),
            "Sending Ollama chat request"
        );

        let response = self
            .http_client
            .post(&url)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, request))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Overload and server errors are worth retrying; other statuses are not.
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                InvocationError::Transport(format!("Ollama API error {}: {}", status, body))
            } else {
                InvocationError::Rejected {
                    status: status.as_u16(),
                    body,
                }
            });
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| InvocationError::Malformed(e.to_string()))?;

        Ok(chat_response.message.content)
    }
}

/// System prompt sent with every stage.
const SYSTEM_PROMPT: &str = r#"You are a careful data analyst for content creators and small businesses.
Answer only from the data you are given.
Reply with exactly one JSON object and nothing else: no markdown, no explanations."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OllamaConfig::default();
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert!(config.system_prompt.contains("JSON"));
    }

    #[test]
    fn test_request_serialization() {
        let body = OllamaChatRequest {
            model: "llama3.2:latest",
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: None,
                num_predict: 256,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["options"]["num_predict"], 256);
        assert!(json["options"].get("temperature").is_none());
        assert_eq!(json["stream"], false);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let invoker = OllamaInvoker::new(OllamaConfig {
            ollama_url: "http://127.0.0.1:9".to_string(),
            ..OllamaConfig::default()
        });
        let request = InvocationRequest {
            prompt: "hi".to_string(),
            model: "m".to_string(),
            max_output_tokens: 8,
            temperature: None,
            timeout: std::time::Duration::from_secs(2),
        };
        let err = invoker.invoke(&request).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }
}
