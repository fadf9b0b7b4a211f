//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{LlmError, TransportError};
use crate::leads::model::Tenant;
use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider, TokenStream};
use crate::prompts::EXTRACTION_PROMPT;
use crate::transport::{RelayDocument, Transport};

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub to: String,
    pub from: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct PlacedCall {
    pub to: String,
    pub from: String,
    pub relay: RelayDocument,
}

/// Transport that records every send and can be told to fail.
#[derive(Default)]
pub struct RecordingTransport {
    messages: Mutex<Vec<SentMessage>>,
    calls: Mutex<Vec<PlacedCall>>,
    fail_messages: AtomicBool,
    fail_calls: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Bodies sent to `to`, in order.
    pub fn bodies_to(&self, to: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.to == to)
            .map(|m| m.body)
            .collect()
    }

    pub fn calls(&self) -> Vec<PlacedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(&self, to: &str, from: &str, body: &str) -> Result<String, TransportError> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                to: to.to_string(),
                reason: "carrier unavailable".to_string(),
            });
        }
        let mut messages = self.messages.lock().unwrap();
        messages.push(SentMessage {
            to: to.to_string(),
            from: from.to_string(),
            body: body.to_string(),
        });
        Ok(format!("SM{}", messages.len()))
    }

    async fn originate_call(
        &self,
        to: &str,
        from: &str,
        relay: &RelayDocument,
    ) -> Result<String, TransportError> {
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(TransportError::CallFailed {
                to: to.to_string(),
                reason: "carrier unavailable".to_string(),
            });
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(PlacedCall {
            to: to.to_string(),
            from: from.to_string(),
            relay: relay.clone(),
        });
        Ok(format!("CA{}", calls.len()))
    }
}

/// One scripted conversational reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    Deltas(Vec<String>),
    /// Fails before producing anything.
    Fail,
    /// Yields these deltas, then the stream errors.
    FailAfter(Vec<String>),
}

impl Scripted {
    pub fn text(deltas: &[&str]) -> Self {
        Self::Deltas(deltas.iter().map(|s| s.to_string()).collect())
    }
}

/// LLM double: conversational replies come from a queue, extraction
/// requests (recognised by their system prompt) get a fixed answer.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Scripted>>,
    extraction: Mutex<Option<String>>,
    pub reply_calls: AtomicUsize,
    pub extraction_calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Scripted>, extraction: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            extraction: Mutex::new(extraction.map(str::to_string)),
            reply_calls: AtomicUsize::new(0),
            extraction_calls: AtomicUsize::new(0),
        })
    }

    fn next_reply(&self) -> Scripted {
        self.reply_calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Scripted::text(&["Okay."]))
    }

    fn failure() -> LlmError {
        LlmError::RequestFailed {
            provider: "scripted".to_string(),
            reason: "scripted failure".to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if request.system_prompt() == Some(EXTRACTION_PROMPT) {
            self.extraction_calls.fetch_add(1, Ordering::SeqCst);
            return match self.extraction.lock().unwrap().clone() {
                Some(content) => Ok(CompletionResponse { content }),
                None => Err(Self::failure()),
            };
        }
        match self.next_reply() {
            Scripted::Deltas(deltas) => Ok(CompletionResponse {
                content: deltas.concat(),
            }),
            Scripted::Fail | Scripted::FailAfter(_) => Err(Self::failure()),
        }
    }

    async fn complete_stream(&self, _request: CompletionRequest) -> Result<TokenStream, LlmError> {
        match self.next_reply() {
            Scripted::Deltas(deltas) => Ok(Box::pin(futures::stream::iter(
                deltas.into_iter().map(Ok),
            ))),
            Scripted::Fail => Err(Self::failure()),
            Scripted::FailAfter(deltas) => {
                let items: Vec<Result<String, LlmError>> = deltas
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(LlmError::StreamFailed {
                        provider: "scripted".to_string(),
                        reason: "connection reset".to_string(),
                    })))
                    .collect();
                Ok(Box::pin(futures::stream::iter(items)))
            }
        }
    }
}

pub fn tenant() -> Tenant {
    Tenant {
        id: "mikes".to_string(),
        business_name: "Mike's Emergency Plumbing".to_string(),
        owner_name: "Mike".to_string(),
        owner_phone: "+14165550199".to_string(),
        transport_address: "+15550001111".to_string(),
        region: "Ontario".to_string(),
        active: true,
    }
}

/// JSON an extraction model would return for a fully captured call.
pub const FULL_EXTRACTION: &str = r#"{"name": "John Smith", "address": "45 George Street, Parramatta", "phone": "0412345678", "problem": "burst pipe flooding kitchen"}"#;
