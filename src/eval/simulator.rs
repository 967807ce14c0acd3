use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use serde_json::json;

use crate::{
    eval::{engine::ConversationTurn, scenario::{SophisticationLevel, UserPersona}},
    extract::{classify_user_signals, extract_user_data, UserSignals},
    types::{ChatMessage, CompletionRequest, TokenUsage},
    workflow::ExtractedData,
    LLMError, LLMProvider,
};

const DEFAULT_TEMPLATE: &str = include_str!("../../prompts/simulator.hbs");

#[derive(Debug, Clone, Copy)]
pub struct SimulatorRequest<'a> {
    pub persona: &'a UserPersona,
    pub last_agent_message: &'a str,
    pub prior_turns: &'a [ConversationTurn],
    /// Used verbatim instead of generating a message.
    pub scripted_override: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedReply {
    pub message: String,
    pub signals: UserSignals,
    pub revealed_data: ExtractedData,
    pub token_usage: TokenUsage,
}

impl SimulatedReply {
    /// Builds a reply from raw text, deriving signals and revealed facts.
    pub fn from_text(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            signals: classify_user_signals(&message),
            revealed_data: extract_user_data(&message),
            message,
            token_usage: TokenUsage::default(),
        }
    }
}

/// Produces the simulated user's side of the conversation.
#[async_trait]
pub trait UserSimulator: Send + Sync {
    async fn generate_response(
        &self,
        request: &SimulatorRequest<'_>,
    ) -> Result<SimulatedReply, LLMError>;
}

/// Role-plays the persona through a chat-completion provider. The persona
/// prompt is a handlebars template; the conversation is replayed with roles
/// swapped so the model speaks as the user.
pub struct LlmUserSimulator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
    template: String,
    handlebars: Handlebars<'static>,
}

impl LlmUserSimulator {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        Self {
            provider,
            model: model.into(),
            temperature: None,
            template: DEFAULT_TEMPLATE.to_string(),
            handlebars,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn render_persona_prompt(&self, persona: &UserPersona) -> Result<String, LLMError> {
        let known: Vec<_> = persona
            .known_data
            .iter()
            .map(|(field, value)| {
                json!({ "field": field.as_str().replace('_', " "), "value": value.to_string() })
            })
            .collect();
        let unknown: Vec<String> = persona
            .unknown_fields
            .iter()
            .map(|field| field.as_str().replace('_', " "))
            .collect();
        let data = json!({
            "name": persona.name,
            "description": persona.description,
            "sophistication": persona.sophistication,
            "novice": persona.sophistication == SophisticationLevel::Novice,
            "expert": persona.sophistication == SophisticationLevel::Expert,
            "known": known,
            "unknown": unknown,
            "uncertainty_percent": (persona.traits.uncertainty_frequency * 100.0).round() as u32,
            "pushback_percent": (persona.traits.pushback_frequency * 100.0).round() as u32,
            "verbosity": persona.traits.verbosity,
            "response_style": persona.response_style,
            "language_patterns": persona.language_patterns,
        });
        Ok(self.handlebars.render_template(&self.template, &data)?)
    }
}

#[async_trait]
impl UserSimulator for LlmUserSimulator {
    async fn generate_response(
        &self,
        request: &SimulatorRequest<'_>,
    ) -> Result<SimulatedReply, LLMError> {
        if let Some(message) = request.scripted_override {
            return Ok(SimulatedReply::from_text(message));
        }

        let mut messages = Vec::with_capacity(request.prior_turns.len() * 2 + 2);
        messages.push(ChatMessage::system(self.render_persona_prompt(request.persona)?));
        for turn in request.prior_turns {
            messages.push(ChatMessage::assistant(turn.user_message.clone()));
            messages.push(ChatMessage::user(turn.agent_response.clone()));
        }
        let already_sent = request
            .prior_turns
            .last()
            .is_some_and(|turn| turn.agent_response == request.last_agent_message);
        if !already_sent && !request.last_agent_message.trim().is_empty() {
            messages.push(ChatMessage::user(request.last_agent_message));
        }

        let mut completion = CompletionRequest::new(self.model.clone(), messages);
        if let Some(temperature) = self.temperature {
            completion = completion.with_temperature(temperature);
        }

        let response = self.provider.complete(completion).await?;
        let text = response
            .message
            .text()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or(LLMError::InvalidResponse("simulator returned an empty message"))?;

        let mut reply = SimulatedReply::from_text(text);
        reply.token_usage = response.usage.unwrap_or_default();
        Ok(reply)
    }
}
