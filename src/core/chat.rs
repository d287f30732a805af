//! Chat engine: the two-phase tool-calling exchange
//!
//! One exchange walks a small state machine:
//!
//! 1. **Initial**: send the transcript and the tool catalog, non-streamed.
//! 2. **Decision**: no tool calls means the reply is final (**Direct**);
//!    otherwise **Dispatching**.
//! 3. **Dispatching**: run every requested tool, collecting one result per
//!    call whatever happens to the others.
//! 4. **Followup**: resend the transcript plus the tool-call announcement and
//!    all results, streamed, with no tools offered.
//! 5. **Streaming**: forward each fragment as it arrives, accumulating the
//!    full text.
//! 6. **Done**.
//!
//! Model failures end the exchange; nothing is retried.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::conversation::Message;
use crate::providers::{ChatModel, Completion, FragmentStream, ProviderError};
use crate::tools::{ToolRegistry, ToolResult};

/// Result of a finished exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOutcome {
    /// The assistant's full reply
    pub text: String,

    /// Tools that were called during this exchange
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallSummary>,
}

/// Summary of a tool call for the outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub id: String,
    pub name: String,
    pub success: bool,
}

/// Errors from the chat engine
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Model request failed: {0}")]
    Upstream(#[from] ProviderError),
}

enum Phase {
    Initial,
    Decision(Completion),
    Direct(String),
    Dispatching(Completion),
    Followup,
    Streaming(FragmentStream),
    Done(String),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Initial => "initial",
            Phase::Decision(_) => "decision",
            Phase::Direct(_) => "direct",
            Phase::Dispatching(_) => "dispatching",
            Phase::Followup => "followup",
            Phase::Streaming(_) => "streaming",
            Phase::Done(_) => "done",
        }
    }
}

/// The core chat engine
pub struct ChatEngine {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    system_prompt: Option<String>,
}

impl ChatEngine {
    pub fn new(model: Arc<dyn ChatModel>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            model,
            tools,
            system_prompt: None,
        }
    }

    /// Prepend a system prompt (the persona) to every transcript
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Run one exchange, sending reply fragments to `fragments` as they are
    /// produced. Returns the full reply once the model is done.
    ///
    /// If the receiver is dropped the exchange still completes; the remaining
    /// fragments are discarded.
    pub async fn exchange(
        &self,
        transcript: Vec<Message>,
        fragments: mpsc::Sender<String>,
    ) -> Result<ExchangeOutcome, ChatError> {
        let mut messages = self.prepare(transcript);
        let mut summary = Vec::new();
        let mut phase = Phase::Initial;

        loop {
            tracing::debug!(phase = phase.name(), "exchange step");

            phase = match phase {
                Phase::Initial => {
                    let tools = self.tools.definitions();
                    Phase::Decision(self.model.complete(&messages, &tools).await?)
                }
                Phase::Decision(completion) if completion.tool_calls.is_empty() => {
                    Phase::Direct(completion.content)
                }
                Phase::Decision(completion) => Phase::Dispatching(completion),
                Phase::Direct(text) => {
                    forward(&fragments, text.clone()).await;
                    Phase::Done(text)
                }
                Phase::Dispatching(completion) => {
                    let results = self.dispatch_all(&completion, &mut summary).await;
                    messages.push(Message::tool_call_announcement(
                        completion.content,
                        completion.tool_calls,
                    ));
                    messages.extend(results.into_iter().map(Message::from));
                    Phase::Followup
                }
                Phase::Followup => Phase::Streaming(self.model.stream(&messages).await?),
                Phase::Streaming(mut stream) => {
                    let mut text = String::new();
                    while let Some(fragment) = stream.next().await {
                        let fragment = fragment?;
                        if fragment.is_empty() {
                            continue;
                        }
                        text.push_str(&fragment);
                        forward(&fragments, fragment).await;
                    }
                    Phase::Done(text)
                }
                Phase::Done(text) => {
                    return Ok(ExchangeOutcome {
                        text,
                        tool_calls: summary,
                    })
                }
            };
        }
    }

    /// Server-side system prompt first, then the caller's transcript verbatim
    fn prepare(&self, transcript: Vec<Message>) -> Vec<Message> {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        messages.extend(transcript);
        messages
    }

    /// Execute each call in announced order; one failure never stops the rest
    async fn dispatch_all(
        &self,
        completion: &Completion,
        summary: &mut Vec<ToolCallSummary>,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(completion.tool_calls.len());

        for call in &completion.tool_calls {
            let result = self.tools.dispatch(call).await;
            tracing::info!(tool = %call.name, call_id = %call.id, success = result.success, "tool call");

            summary.push(ToolCallSummary {
                id: call.id.clone(),
                name: call.name.clone(),
                success: result.success,
            });
            results.push(result);
        }

        results
    }
}

async fn forward(fragments: &mpsc::Sender<String>, fragment: String) {
    if fragment.is_empty() {
        return;
    }
    if fragments.send(fragment).await.is_err() {
        tracing::debug!("caller went away, dropping fragment");
    }
}
