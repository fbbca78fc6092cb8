use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::protocol::InferenceRequest;
use super::InferenceService;
use crate::constants::AGENT_MAX_TOKENS;
use crate::error::AgentError;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    error: Option<ChatError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatError {
    message: String,
}

pub struct ChatCompletionsClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl ChatCompletionsClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AgentError::Request(format!("could not build http client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        })
    }
}

#[async_trait]
impl InferenceService for ChatCompletionsClient {
    async fn request_moves(&self, request: &InferenceRequest) -> Result<String, AgentError> {
        let payload = ChatRequest {
            model: &self.model,
            max_tokens: AGENT_MAX_TOKENS,
            messages: vec![ChatMessage {
                role: "user",
                content: request.prompt(),
            }],
        };

        let mut builder = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| AgentError::Request(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AgentError::Request(format!("could not read body: {err}")))?;
        debug!(%status, bytes = body.len(), "inference response received");
        extract_content(status.is_success(), status.as_u16(), &body)
    }
}

fn extract_content(success: bool, status: u16, body: &str) -> Result<String, AgentError> {
    let parsed: Result<ChatResponse, _> = serde_json::from_str(body);
    if let Ok(ChatResponse {
        error: Some(error), ..
    }) = &parsed
    {
        return Err(AgentError::Service(error.message.clone()));
    }
    if !success {
        return Err(AgentError::Service(format!("status {status}: {body}")));
    }
    let response =
        parsed.map_err(|err| AgentError::Malformed(format!("invalid completion body: {err}")))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| AgentError::Malformed("completion has no content".to_string()))
}
