use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    types::{ChatMessage, CompletionRequest, TokenUsage},
    LLMError, LLMProvider,
};

#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub token_usage: TokenUsage,
}

/// The conversational agent being evaluated.
#[async_trait]
pub trait AgentUnderTest: Send + Sync {
    /// `history` alternates user and assistant messages and ends with the
    /// newest user message. `injected_knowledge` may be empty.
    async fn respond(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        injected_knowledge: &str,
    ) -> Result<AgentReply, LLMError>;
}

/// An agent backed directly by a chat-completion provider.
pub struct LlmAgent {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl LlmAgent {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

fn system_message(system_prompt: &str, injected_knowledge: &str) -> String {
    if injected_knowledge.trim().is_empty() {
        return system_prompt.to_string();
    }
    format!("{system_prompt}\n\n## Reference material\n\n{injected_knowledge}")
}

#[async_trait]
impl AgentUnderTest for LlmAgent {
    async fn respond(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        injected_knowledge: &str,
    ) -> Result<AgentReply, LLMError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system_message(system_prompt, injected_knowledge)));
        messages.extend(history.iter().cloned());

        let mut request = CompletionRequest::new(self.model.clone(), messages);
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        let response = self.provider.complete(request).await?;
        let text = response
            .message
            .text()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or(LLMError::InvalidResponse("agent returned an empty message"))?
            .to_string();

        Ok(AgentReply {
            text,
            token_usage: response.usage.unwrap_or_default(),
        })
    }
}
