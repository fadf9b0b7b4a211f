//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use futures::StreamExt;
use rig::completion::{AssistantContent, CompletionModel, Message};
use rig::streaming::StreamedAssistantContent;

use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, LlmProvider, Role, TokenStream,
};

/// Adapter wrapping any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }

    /// Convert our request into a rig request.
    ///
    /// System messages become the preamble; the final non-system message is
    /// the prompt and everything before it is chat history.
    fn build_request(
        &self,
        request: CompletionRequest,
    ) -> Result<rig::completion::CompletionRequest, LlmError> {
        let mut preamble = String::new();
        let mut history: Vec<Message> = Vec::new();

        for msg in request.messages {
            match msg.role {
                Role::System => {
                    if !preamble.is_empty() {
                        preamble.push_str("\n\n");
                    }
                    preamble.push_str(&msg.content);
                }
                Role::User => history.push(Message::user(msg.content)),
                Role::Assistant => history.push(Message::assistant(msg.content)),
            }
        }

        let prompt = history.pop().ok_or_else(|| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: "completion request has no user or assistant messages".to_string(),
        })?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if !preamble.is_empty() {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature as f64);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens as u64);
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let request = self.build_request(request)?;
        let response = self
            .model
            .completion(request)
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: e.to_string(),
            })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse { content })
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<TokenStream, LlmError> {
        let request = self.build_request(request)?;
        let provider = self.model_name.clone();
        let response = self
            .model
            .stream(request)
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: provider.clone(),
                reason: e.to_string(),
            })?;

        let deltas = response.filter_map(move |item| {
            let provider = provider.clone();
            async move {
                match item {
                    Ok(StreamedAssistantContent::Text(text)) => Some(Ok(text.text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(LlmError::StreamFailed {
                        provider,
                        reason: e.to_string(),
                    })),
                }
            }
        });

        Ok(Box::pin(deltas))
    }
}
