use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::config::CompletionConfig;
use crate::relay::conversation_state::{Turn, TurnContent};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request to completion API failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion API returned {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed completion response: {0}")]
    MalformedResponse(String),
}

/// Anything that can turn an ordered list of turns into one reply.
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    async fn complete(&self, messages: &[Turn]) -> Result<String, GatewayError>;
}

/// Client for OpenAI-compatible `chat/completions` endpoints.
pub struct CompletionClient {
    api_key: String,
    model: String,
    max_tokens: u32,
    endpoint: Url,
    client: reqwest::Client,
}

impl CompletionClient {
    pub fn new(config: &CompletionConfig) -> eyre::Result<Self> {
        let endpoint = config.base_url.join("chat/completions")?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            endpoint,
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl CompletionGateway for CompletionClient {
    async fn complete(&self, messages: &[Turn]) -> Result<String, GatewayError> {
        let request_body = request_body(&self.model, self.max_tokens, messages);

        debug!(
            model = %self.model,
            messages = messages.len(),
            "Sending request to completion API: {}",
            describe_messages(messages)
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Completion API request failed with {}: {}", status, body);
            return Err(GatewayError::Api { status, body });
        }

        let response_json: Value = response.json().await?;
        debug!("Received response from completion API: {}", response_json);

        parse_reply(&response_json)
    }
}

/// Build the JSON body of a chat completion request.
pub fn request_body(model: &str, max_tokens: u32, messages: &[Turn]) -> Value {
    let formatted_messages = messages
        .iter()
        .map(|turn| {
            json!({
                "role": turn.role().as_str(),
                "content": content_value(turn.content()),
            })
        })
        .collect::<Vec<_>>();

    json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": formatted_messages,
    })
}

fn content_value(content: &TurnContent) -> Value {
    match content {
        TurnContent::Text(text) => Value::String(text.clone()),
        TurnContent::Image { text, image } => {
            let data_url = format!(
                "data:{};base64,{}",
                image.mime_type(),
                STANDARD.encode(image.bytes())
            );
            json!([
                { "type": "text", "text": text },
                { "type": "image_url", "image_url": { "url": data_url } },
            ])
        }
    }
}

/// Extract `choices[0].message.content` from a completion response.
pub fn parse_reply(response_json: &Value) -> Result<String, GatewayError> {
    let content = response_json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            GatewayError::MalformedResponse("missing choices[0].message.content".to_string())
        })?;

    if content.trim().is_empty() {
        return Err(GatewayError::MalformedResponse("empty completion".to_string()));
    }

    Ok(content.to_string())
}

// Image payloads are elided so debug logs stay readable.
fn describe_messages(messages: &[Turn]) -> String {
    messages
        .iter()
        .map(|turn| match turn.content() {
            TurnContent::Text(text) => format!("[{}] {}", turn.role().as_str(), text),
            TurnContent::Image { text, image } => format!(
                "[{}] {} <{} bytes of {}>",
                turn.role().as_str(),
                text,
                image.bytes().len(),
                image.mime_type()
            ),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
