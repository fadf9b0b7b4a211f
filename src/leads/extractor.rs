//! Lead extraction: turns a finished conversation into structured lead data.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::UrgencyPolicy;
use crate::error::LlmError;
use crate::leads::model::{Speaker, Turn};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::prompts::EXTRACTION_PROMPT;

/// Fewer turns than this never produce a lead.
pub const MIN_TURNS: usize = 2;

/// Structured result of an extraction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadExtraction {
    /// Name, address and phone are all present.
    pub captured: bool,
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub problem: Option<String>,
    pub urgent: bool,
}

/// What the model is asked to return.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawExtraction {
    name: Option<String>,
    address: Option<String>,
    phone: Option<String>,
    problem: Option<String>,
}

pub struct LeadExtractor {
    llm: Arc<dyn LlmProvider>,
    urgency: UrgencyPolicy,
    timeout: Duration,
}

impl LeadExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, urgency: UrgencyPolicy, timeout: Duration) -> Self {
        Self {
            llm,
            urgency,
            timeout,
        }
    }

    /// Run one extraction pass over the full conversation.
    ///
    /// `Ok(None)` means "no lead": too little history or output that could
    /// not be parsed. `Err` is reserved for generation-service failures.
    pub async fn extract(&self, turns: &[Turn]) -> Result<Option<LeadExtraction>, LlmError> {
        if turns.len() < MIN_TURNS {
            debug!(turns = turns.len(), "Too little history to extract a lead");
            return Ok(None);
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(EXTRACTION_PROMPT),
            ChatMessage::user(render_transcript(turns)),
        ])
        .with_temperature(0.0)
        .with_max_tokens(300);

        let response = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.llm.model_name().to_string(),
                timeout: self.timeout,
            })??;

        let json_str = extract_json_object(&response.content);
        let raw: RawExtraction = match serde_json::from_str(&json_str) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    error = %e,
                    response = %response.content,
                    "Failed to parse lead extraction"
                );
                return Ok(None);
            }
        };

        Ok(Some(self.finish(raw, turns)))
    }

    /// Does anything the customer said match an emergency keyword?
    pub fn is_urgent(&self, turns: &[Turn]) -> bool {
        turns
            .iter()
            .filter(|t| t.speaker == Speaker::Customer)
            .any(|t| self.urgency.matches(&t.text))
    }

    fn finish(&self, raw: RawExtraction, turns: &[Turn]) -> LeadExtraction {
        let name = clean(raw.name);
        let address = clean(raw.address);
        let phone = clean(raw.phone);
        let problem = clean(raw.problem);
        LeadExtraction {
            captured: name.is_some() && address.is_some() && phone.is_some(),
            urgent: self.is_urgent(turns),
            name,
            address,
            phone,
            problem,
        }
    }
}

/// Render turns as a plain transcript for the extraction prompt.
fn render_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| match t.speaker {
            Speaker::Customer => format!("Customer: {}", t.text),
            Speaker::Agent => format!("Receptionist: {}", t.text),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Treat blanks and literal "null"/"unknown" as missing.
fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .filter(|v| !matches!(v.to_lowercase().as_str(), "null" | "none" | "unknown" | "n/a"))
}

/// Pull a JSON object out of model output that may be wrapped in prose or
/// markdown fences.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    // Try to find object bounds
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}
