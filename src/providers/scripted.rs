use std::{
    collections::VecDeque,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
    LLMError,
};

/// Replays canned responses in order. Errors once the script runs out.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    fn next_response(&self) -> Option<String> {
        self.responses.lock().ok()?.pop_front()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let prompt_tokens = request
            .messages
            .iter()
            .filter_map(ChatMessage::text)
            .map(rough_token_count)
            .sum::<u32>();

        if let Ok(mut guard) = self.requests.lock() {
            guard.push(request);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let response = self
            .next_response()
            .ok_or_else(|| LLMError::Provider("no more scripted responses".to_string()))?;
        let completion_tokens = rough_token_count(&response);

        Ok(CompletionResponse {
            message: ChatMessage::assistant(response),
            usage: Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn rough_token_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let provider = ScriptedProvider::new(["first", "second"]);
        let request = CompletionRequest::new("m", vec![ChatMessage::user("hello there")]);

        let first = provider.complete(request.clone()).await.unwrap();
        assert_eq!(first.message.text(), Some("first"));
        assert_eq!(first.usage.unwrap().prompt_tokens, 2);

        let second = provider.complete(request.clone()).await.unwrap();
        assert_eq!(second.message.text(), Some("second"));

        let err = provider.complete(request).await.unwrap_err();
        assert!(matches!(err, LLMError::Provider(_)));
        assert_eq!(provider.requests().len(), 3);
        assert_eq!(provider.remaining(), 0);
    }
}
