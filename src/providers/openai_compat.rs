//! OpenAI-compatible provider
//!
//! Works with any API that implements the OpenAI chat completions format
//! (OpenAI itself, Groq, vLLM, LM Studio, LocalAI, ...). Tool calling uses
//! the native `tools` / `tool_calls` fields; streaming uses server-sent
//! events terminated by `data: [DONE]`.
//!
//! # Configuration
//!
//! ```toml
//! [llm]
//! base_url = "https://api.openai.com/v1"
//! api_key_env = "OPENAI_API_KEY"
//! model = "gpt-4o-mini"
//! ```

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{Message, Role, ToolCall};
use crate::tools::ToolDefinition;

use super::{ChatModel, Completion, FragmentStream, ProviderError};

/// Hosted endpoints refuse keyless requests; local servers usually accept them
const HOSTED_API_DOMAIN: &str = "api.openai.com";

/// OpenAI-compatible chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        let tool_calls = (!msg.tool_calls.is_empty())
            .then(|| msg.tool_calls.iter().map(WireToolCall::from).collect());

        // Assistant turns that only announce tool calls carry a null content
        let content = if tool_calls.is_some() && msg.content.is_empty() {
            None
        } else {
            Some(msg.content.clone())
        };

        Self {
            role: msg.role.as_str().to_string(),
            content,
            tool_call_id: msg.tool_call_id.clone(),
            name: match msg.role {
                Role::Tool => msg.name.clone(),
                _ => None,
            },
            tool_calls,
        }
    }
}

/// Tool call as it appears on the wire, arguments as a JSON string
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            call_type: function_type(),
            function: FunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        }
    }
}

impl From<WireToolCall> for ToolCall {
    fn from(wire: WireToolCall) -> Self {
        let arguments = if wire.function.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&wire.function.arguments).unwrap_or_else(|e| {
                tracing::warn!(
                    tool = %wire.function.name,
                    error = %e,
                    "unparseable tool arguments, using empty object"
                );
                Value::Object(Default::default())
            })
        };

        ToolCall {
            id: wire.id,
            name: wire.function.name,
            arguments,
        }
    }
}

/// Tool definition for function calling
#[derive(Debug, Clone, Serialize)]
struct ToolDef {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: FunctionDef,
}

#[derive(Debug, Clone, Serialize)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDefinition> for ToolDef {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            tool_type: "function",
            function: FunctionDef {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            },
        }
    }
}

/// Chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    stream: bool,
}

/// Chat completion response
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

/// One `data:` payload of a streamed completion
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Error response from API
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone)]
pub struct OpenAICompatConfig {
    /// Base URL for the API (e.g., https://api.openai.com/v1)
    pub base_url: String,
    /// API key (optional for local servers)
    pub api_key: Option<String>,
    /// Model to use
    pub model: String,
    pub temperature: Option<f32>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAICompatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: Some(0.6),
            timeout_secs: 120,
        }
    }
}

/// OpenAI-compatible API provider
pub struct OpenAICompatProvider {
    config: OpenAICompatConfig,
    client: Client,
}

impl OpenAICompatProvider {
    pub fn new(config: OpenAICompatConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn request(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        stream: bool,
    ) -> ChatCompletionRequest {
        let tools: Vec<ToolDef> = tools.iter().map(ToolDef::from).collect();
        let has_tools = !tools.is_empty();

        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: messages.iter().map(ChatMessage::from).collect(),
            temperature: self.config.temperature,
            tools: has_tools.then_some(tools),
            tool_choice: has_tools.then_some("auto"),
            stream,
        }
    }

    async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, ProviderError> {
        if self.config.api_key.is_none() && self.config.base_url.contains(HOSTED_API_DOMAIN) {
            return Err(ProviderError::NotConfigured(format!(
                "an API key is required for {}",
                self.config.base_url
            )));
        }

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let mut req_builder = self.client.post(&url);

        if let Some(ref api_key) = self.config.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder.json(request).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if let Ok(error_resp) = serde_json::from_str::<ErrorResponse>(&body) {
            return Err(ProviderError::InvalidResponse(format!(
                "API error: {}",
                error_resp.error.message
            )));
        }
        Err(ProviderError::InvalidResponse(format!("HTTP {}: {}", status, body)))
    }
}

#[async_trait]
impl ChatModel for OpenAICompatProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Completion, ProviderError> {
        let request = self.request(messages, tools, false);
        let body = self.send(&request).await?.text().await?;
        parse_completion(&body)
    }

    async fn stream(&self, messages: &[Message]) -> Result<FragmentStream, ProviderError> {
        let request = self.request(messages, &[], true);
        let response = self.send(&request).await?;
        Ok(Box::pin(decode_fragments(response.bytes_stream())))
    }
}

/// Turn a raw SSE byte stream into text fragments, stopping at `[DONE]`.
///
/// A body that ends without `[DONE]` is an interrupted reply and yields a
/// trailing error after whatever text did arrive.
pub(super) fn decode_fragments<S, B>(bytes: S) -> impl Stream<Item = Result<String, ProviderError>> + Send + 'static
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::default();
        let mut done = false;

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for event in decoder.feed(chunk.as_ref())? {
                match event {
                    SseEvent::Delta(text) if !done => {
                        yield text;
                    }
                    SseEvent::Delta(_) => {}
                    SseEvent::Done => done = true,
                }
            }
            if done {
                break;
            }
        }

        if !done {
            for event in decoder.finish()? {
                match event {
                    SseEvent::Delta(text) if !done => {
                        yield text;
                    }
                    SseEvent::Delta(_) => {}
                    SseEvent::Done => done = true,
                }
            }
        }

        if !done {
            Err::<(), _>(ProviderError::Stream("stream ended before [DONE]".into()))?;
        }
    }
}

fn parse_completion(body: &str) -> Result<Completion, ProviderError> {
    let completion: ChatCompletionResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::InvalidResponse(format!("Failed to parse response: {} - Body: {}", e, body))
    })?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".to_string()))?;

    Ok(Completion {
        content: choice.message.content.unwrap_or_default(),
        tool_calls: choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(ToolCall::from)
            .collect(),
    })
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Delta(String),
    Done,
}

/// Incremental decoder for `text/event-stream` completion chunks.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, ProviderError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                events.push(SseEvent::Done);
                continue;
            }

            if let Ok(error) = serde_json::from_str::<ErrorResponse>(data) {
                return Err(ProviderError::Stream(error.error.message));
            }

            let chunk: ChatCompletionChunk = serde_json::from_str(data)
                .map_err(|e| ProviderError::Stream(format!("bad chunk: {} - {}", e, data)))?;

            for choice in chunk.choices {
                if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                    events.push(SseEvent::Delta(text));
                }
            }
        }

        Ok(events)
    }

    /// Decode a final line left without its newline at end of body
    fn finish(&mut self) -> Result<Vec<SseEvent>, ProviderError> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return Ok(Vec::new());
        }
        self.feed(b"\n")
    }
}
