//! Real-time session controller.
//!
//! Drives one relay connection from setup to close: persists each turn,
//! streams generated replies back in speakable chunks, hangs up when the
//! agent says goodbye, and finalizes the session exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::ChannelError;
use crate::leads::extractor::{LeadExtraction, LeadExtractor};
use crate::leads::model::{Lead, LeadChannel, LeadStatus, SessionKey, Tenant, Turn};
use crate::leads::notify::{INCOMPLETE_PROBLEM, LeadAlert, NotificationDispatcher, UNKNOWN_CALLER};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::prompts;
use crate::session::protocol::{RelayConnection, RelayEvent, RelayReply, parse_event};
use crate::session::segmenter::Segmenter;
use crate::store::Database;

/// Problem text for a captured lead that never described one.
const NO_PROBLEM_GIVEN: &str = "No details given";

/// Which endpoint the call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// A customer calling a tenant.
    Inbound,
    /// A prospect answering a demo call placed by the campaign.
    Demo,
}

/// Why the read loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// The relay sent `end`.
    RemoteEnded,
    /// The agent said goodbye and hung up.
    AgentEnded,
    /// The connection closed without `end`.
    Closed,
    IdleTimeout,
    ChannelFailed(String),
}

/// Hooks for demo calls, implemented by the nurture engine.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// The prospect picked up a demo call.
    async fn demo_connected(&self, prospect_phone: &str);

    /// The demo call is over.
    async fn demo_closed(&self, prospect_phone: &str);
}

/// Who and what a session is about, fixed at setup.
#[derive(Debug, Clone)]
struct Binding {
    caller: String,
    tenant: Tenant,
    /// Inbound number for the idempotency key.
    tenant_address: String,
    session_id: String,
    system_prompt: String,
    /// Set when impersonating a prospect's business.
    demo_phone: Option<String>,
}

pub struct SessionController {
    db: Arc<dyn Database>,
    llm: Arc<dyn LlmProvider>,
    extractor: Arc<LeadExtractor>,
    dispatcher: Arc<NotificationDispatcher>,
    config: SessionConfig,
    default_tenant: Tenant,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl SessionController {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        extractor: Arc<LeadExtractor>,
        dispatcher: Arc<NotificationDispatcher>,
        config: SessionConfig,
        default_tenant: Tenant,
    ) -> Self {
        Self {
            db,
            llm,
            extractor,
            dispatcher,
            config,
            default_tenant,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run one session to completion, including finalize.
    pub async fn run<C: RelayConnection>(&self, mut conn: C, mode: SessionMode) -> SessionExit {
        let mut binding: Option<Binding> = None;
        let mut history: Vec<ChatMessage> = Vec::new();

        let exit = loop {
            let raw = match tokio::time::timeout(self.config.idle_timeout, conn.recv_text()).await
            {
                Err(_) => break SessionExit::IdleTimeout,
                Ok(Err(e)) => break SessionExit::ChannelFailed(e.to_string()),
                Ok(Ok(None)) => break SessionExit::Closed,
                Ok(Ok(Some(raw))) => raw,
            };

            let event = match parse_event(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed relay event");
                    continue;
                }
            };

            match event {
                RelayEvent::Setup { call_sid, from, to } => {
                    if binding.is_some() {
                        warn!("Duplicate setup event ignored");
                        continue;
                    }
                    let bound = self.bind(mode, call_sid, from, to).await;
                    info!(
                        caller = %bound.caller,
                        tenant = %bound.tenant.id,
                        session = %bound.session_id,
                        demo = bound.demo_phone.is_some(),
                        "Session started"
                    );
                    binding = Some(bound);
                }
                RelayEvent::Prompt { voice_prompt } => {
                    let text = voice_prompt.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let Some(bound) = binding.as_ref() else {
                        warn!("Prompt before setup ignored");
                        continue;
                    };
                    match self.handle_prompt(&mut conn, bound, &mut history, text).await {
                        Ok(false) => {}
                        Ok(true) => {
                            info!(caller = %bound.caller, "Agent ended the call");
                            if let Err(e) = conn.send(&RelayReply::End).await {
                                warn!(error = %e, "Failed to send end");
                            }
                            break SessionExit::AgentEnded;
                        }
                        Err(e) => break SessionExit::ChannelFailed(e.to_string()),
                    }
                }
                RelayEvent::Dtmf { digit } => debug!(digit = %digit, "DTMF ignored"),
                RelayEvent::End { reason } => {
                    info!(reason = reason.as_deref().unwrap_or("unknown"), "Relay ended the call");
                    break SessionExit::RemoteEnded;
                }
                RelayEvent::Other => debug!(raw = %raw, "Unhandled relay event"),
            }
        };

        info!(exit = ?exit, turns = history.len(), "Session loop finished");

        if let Some(bound) = binding {
            if history.is_empty() {
                debug!(caller = %bound.caller, "No turns this session; nothing to finalize");
            } else {
                self.finalize(&bound).await;
            }
            if let (Some(phone), Some(observer)) = (bound.demo_phone.as_deref(), &self.observer) {
                observer.demo_closed(phone).await;
            }
        }

        exit
    }

    /// Resolve caller and tenant from the setup event.
    async fn bind(
        &self,
        mode: SessionMode,
        call_sid: Option<String>,
        from: Option<String>,
        to: Option<String>,
    ) -> Binding {
        let session_id = call_sid
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if mode == SessionMode::Demo {
            if let Some(binding) = self.bind_demo(&session_id, from.as_deref(), to.as_deref()).await {
                return binding;
            }
            warn!("No demo session for this call; answering as the default business");
        }

        let caller = from.unwrap_or_else(|| "unknown".to_string());
        let tenant_address = to.unwrap_or_else(|| self.default_tenant.transport_address.clone());
        let tenant = match self.db.get_tenant_by_address(&tenant_address).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) => self.default_tenant.clone(),
            Err(e) => {
                error!(error = %e, "Tenant lookup failed; using default tenant");
                self.default_tenant.clone()
            }
        };

        Binding {
            system_prompt: prompts::voice_system_prompt(&tenant),
            caller,
            tenant,
            tenant_address,
            session_id,
            demo_phone: None,
        }
    }

    /// A demo call is outbound: the prospect is usually `to`, our number `from`.
    async fn bind_demo(
        &self,
        session_id: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Option<Binding> {
        let now = Utc::now();
        for (candidate, other) in [(to, from), (from, to)] {
            let Some(phone) = candidate else { continue };
            let demo = match self.db.get_demo_session(phone, now).await {
                Ok(Some(demo)) => demo,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Demo session lookup failed");
                    continue;
                }
            };

            if let Some(observer) = &self.observer {
                observer.demo_connected(&demo.prospect_phone).await;
            }

            let our_number = other
                .map(str::to_string)
                .unwrap_or_else(|| self.default_tenant.transport_address.clone());
            let tenant = Tenant {
                id: format!("demo:{}", demo.prospect_phone),
                business_name: demo.business_name.clone(),
                owner_name: demo.owner_name.clone(),
                owner_phone: demo.prospect_phone.clone(),
                transport_address: our_number.clone(),
                region: self.default_tenant.region.clone(),
                active: true,
            };
            return Some(Binding {
                system_prompt: prompts::demo_system_prompt(&demo.business_name, &demo.owner_name),
                caller: demo.prospect_phone.clone(),
                tenant,
                tenant_address: our_number,
                session_id: session_id.to_string(),
                demo_phone: Some(demo.prospect_phone),
            });
        }
        None
    }

    /// Handle one caller utterance. Returns true when the agent's reply
    /// ends the call.
    async fn handle_prompt<C: RelayConnection>(
        &self,
        conn: &mut C,
        bound: &Binding,
        history: &mut Vec<ChatMessage>,
        text: &str,
    ) -> Result<bool, ChannelError> {
        debug!(caller = %bound.caller, text, "Caller said");
        self.persist(bound, Turn::customer(text)).await;
        history.push(ChatMessage::user(text));

        let reply = self.stream_reply(conn, bound, history).await?;

        debug!(caller = %bound.caller, reply = %reply, "Agent replied");
        self.persist(bound, Turn::agent(reply.clone())).await;
        history.push(ChatMessage::assistant(reply.clone()));

        Ok(self.config.completion.is_complete(&reply))
    }

    /// Stream a generated reply to the relay. Returns the full reply text.
    ///
    /// Generation failures are answered with the apology line; the session
    /// carries on.
    async fn stream_reply<C: RelayConnection>(
        &self,
        conn: &mut C,
        bound: &Binding,
        history: &[ChatMessage],
    ) -> Result<String, ChannelError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(bound.system_prompt.clone()));
        messages.extend(history.iter().cloned());
        let request = CompletionRequest::new(messages)
            .with_max_tokens(self.config.reply_max_tokens)
            .with_temperature(self.config.reply_temperature);

        let timeout = self.config.generation_timeout;
        let apology = prompts::voice_apology(&bound.tenant);

        let mut stream =
            match tokio::time::timeout(timeout, self.llm.complete_stream(request)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(error = %e, "Generation failed; sending apology");
                    conn.send(&RelayReply::text(apology.clone(), true)).await?;
                    return Ok(apology);
                }
                Err(_) => {
                    warn!(?timeout, "Generation timed out; sending apology");
                    conn.send(&RelayReply::text(apology.clone(), true)).await?;
                    return Ok(apology);
                }
            };

        let mut segmenter = Segmenter::new();
        let mut failed = false;
        loop {
            match tokio::time::timeout(timeout, stream.next()).await {
                Ok(Some(Ok(delta))) => {
                    if let Some(chunk) = segmenter.push(&delta) {
                        conn.send(&RelayReply::text(chunk, false)).await?;
                    }
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Reply stream failed mid-turn");
                    failed = true;
                    break;
                }
                Err(_) => {
                    warn!(?timeout, "Reply stream stalled");
                    failed = true;
                    break;
                }
            }
        }

        let (rest, full) = segmenter.finish();

        if failed {
            if !rest.is_empty() {
                conn.send(&RelayReply::text(rest, false)).await?;
            }
            conn.send(&RelayReply::text(apology.clone(), true)).await?;
            return Ok(if full.trim().is_empty() {
                apology
            } else {
                format!("{} {apology}", full.trim_end())
            });
        }

        if full.trim().is_empty() {
            warn!("Empty generation; sending apology");
            conn.send(&RelayReply::text(apology.clone(), true)).await?;
            return Ok(apology);
        }

        conn.send(&RelayReply::text(rest, true)).await?;
        Ok(full)
    }

    async fn persist(&self, bound: &Binding, turn: Turn) {
        if let Err(e) = self
            .db
            .append_turn(&bound.caller, &bound.tenant.id, &turn)
            .await
        {
            error!(caller = %bound.caller, error = %e, "Failed to persist turn");
        }
    }

    /// Extract, store and report the session's lead. Guarded so it runs at
    /// most once per (caller, tenant address, session id).
    async fn finalize(&self, bound: &Binding) {
        let turns = match self.db.get_conversation(&bound.caller, &bound.tenant.id).await {
            Ok(turns) => turns,
            Err(e) => {
                error!(caller = %bound.caller, error = %e, "Failed to load conversation");
                Vec::new()
            }
        };

        // Claimed with a partial alert so the lead survives a crash during extraction.
        let key = SessionKey::new(&bound.caller, &bound.tenant_address, &bound.session_id);
        let provisional = self.partial_alert(bound, LeadExtraction::default(), &turns);
        match self
            .dispatcher
            .claim(
                &key,
                &bound.tenant.owner_phone,
                &bound.tenant.transport_address,
                &provisional,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(caller = %bound.caller, session = %bound.session_id, "Session already finalized");
                return;
            }
            Err(e) => {
                error!(caller = %bound.caller, error = %e, "Could not claim session for finalize");
                return;
            }
        }

        let extraction = match self.extractor.extract(&turns).await {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!(caller = %bound.caller, error = %e, "Lead extraction failed");
                None
            }
        };

        let alert = match extraction {
            Some(lead) if lead.captured => {
                self.store_lead(bound, &lead).await;
                LeadAlert {
                    urgent: lead.urgent,
                    partial: false,
                    channel: LeadChannel::Voice,
                    name: lead.name.unwrap_or_else(|| UNKNOWN_CALLER.to_string()),
                    address: lead.address,
                    contact_phone: lead.phone.unwrap_or_else(|| bound.caller.clone()),
                    problem: lead.problem.unwrap_or_else(|| NO_PROBLEM_GIVEN.to_string()),
                }
            }
            partial => self.partial_alert(bound, partial.unwrap_or_default(), &turns),
        };

        match self
            .dispatcher
            .deliver(
                &key,
                &bound.tenant.owner_phone,
                &bound.tenant.transport_address,
                &alert,
            )
            .await
        {
            Ok(true) => info!(caller = %bound.caller, partial = alert.partial, "Session finalized"),
            Ok(false) => warn!(caller = %bound.caller, "Session finalized; alert pending retry"),
            Err(e) => error!(caller = %bound.caller, error = %e, "Failed to record alert"),
        }
    }

    /// Best-effort alert for a session that did not capture a full lead.
    fn partial_alert(&self, bound: &Binding, partial: LeadExtraction, turns: &[Turn]) -> LeadAlert {
        LeadAlert {
            urgent: partial.urgent || self.extractor.is_urgent(turns),
            partial: true,
            channel: LeadChannel::Voice,
            name: partial.name.unwrap_or_else(|| UNKNOWN_CALLER.to_string()),
            address: partial.address,
            contact_phone: bound.caller.clone(),
            problem: partial.problem.unwrap_or_else(|| INCOMPLETE_PROBLEM.to_string()),
        }
    }

    async fn store_lead(&self, bound: &Binding, extraction: &LeadExtraction) {
        let now = Utc::now();
        let lead = Lead {
            phone: bound.caller.clone(),
            tenant_id: bound.tenant.id.clone(),
            name: extraction.name.clone(),
            address: extraction.address.clone(),
            contact_phone: extraction.phone.clone(),
            problem: extraction.problem.clone(),
            urgent: extraction.urgent,
            channel: LeadChannel::Voice,
            status: LeadStatus::New,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.db.upsert_lead(&lead).await {
            error!(caller = %bound.caller, error = %e, "Failed to store lead");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::config::UrgencyPolicy;
    use crate::nurture::model::DemoSession;
    use crate::store::LibSqlBackend;
    use crate::testing::{self, FULL_EXTRACTION, RecordingTransport, Scripted, ScriptedLlm};

    /// What the relay does once its scripted frames run out.
    #[derive(Clone, Copy)]
    enum Tail {
        Close,
        /// Never sends another frame.
        Stall,
        /// The socket breaks.
        Fail,
    }

    /// Relay double: replays scripted frames, records replies.
    struct FakeRelay {
        inbound: VecDeque<String>,
        tail: Tail,
        sent: Arc<Mutex<Vec<RelayReply>>>,
    }

    impl FakeRelay {
        fn new(frames: &[&str]) -> (Self, Arc<Mutex<Vec<RelayReply>>>) {
            Self::with_tail(frames, Tail::Close)
        }

        fn with_tail(frames: &[&str], tail: Tail) -> (Self, Arc<Mutex<Vec<RelayReply>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    inbound: frames.iter().map(|s| s.to_string()).collect(),
                    tail,
                    sent: sent.clone(),
                },
                sent,
            )
        }
    }

    #[async_trait]
    impl RelayConnection for FakeRelay {
        async fn recv_text(&mut self) -> Result<Option<String>, ChannelError> {
            if let Some(frame) = self.inbound.pop_front() {
                return Ok(Some(frame));
            }
            match self.tail {
                Tail::Close => Ok(None),
                Tail::Stall => std::future::pending().await,
                Tail::Fail => Err(ChannelError::Disconnected {
                    name: "relay".to_string(),
                    reason: "connection reset".to_string(),
                }),
            }
        }

        async fn send(&mut self, reply: &RelayReply) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(reply.clone());
            Ok(())
        }
    }

    struct Harness {
        controller: SessionController,
        db: Arc<dyn Database>,
        transport: Arc<RecordingTransport>,
        llm: Arc<ScriptedLlm>,
    }

    async fn harness(replies: Vec<Scripted>, extraction: Option<&str>) -> Harness {
        harness_with(replies, extraction, SessionConfig::default()).await
    }

    async fn harness_with(
        replies: Vec<Scripted>,
        extraction: Option<&str>,
        config: SessionConfig,
    ) -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.upsert_tenant(&testing::tenant()).await.unwrap();
        let llm = ScriptedLlm::new(replies, extraction);
        let transport = RecordingTransport::new();
        let extractor = Arc::new(LeadExtractor::new(
            llm.clone(),
            UrgencyPolicy::default(),
            Duration::from_secs(5),
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(db.clone(), transport.clone()));
        let controller = SessionController::new(
            db.clone(),
            llm.clone(),
            extractor,
            dispatcher,
            config,
            testing::tenant(),
        );
        Harness {
            controller,
            db,
            transport,
            llm,
        }
    }

    const SETUP: &str = r#"{"type":"setup","callSid":"CA1","from":"+14165551234","to":"+15550001111"}"#;

    fn prompt(text: &str) -> String {
        serde_json::json!({"type": "prompt", "voicePrompt": text}).to_string()
    }

    fn texts(sent: &[RelayReply]) -> Vec<(String, bool)> {
        sent.iter()
            .filter_map(|r| match r {
                RelayReply::Text { token, last } => Some((token.clone(), *last)),
                RelayReply::End => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn full_capture_notifies_once() {
        let h = harness(
            vec![
                Scripted::text(&["Thanks John.", " What's your address?"]),
                Scripted::text(&["Got it, and the best number?"]),
                Scripted::text(&["And what's the problem?"]),
                Scripted::text(&["Oh no, that sounds urgent. ", "Mike will call right back."]),
            ],
            Some(FULL_EXTRACTION),
        )
        .await;

        let frames = [
            SETUP.to_string(),
            prompt("John Smith"),
            prompt("45 George Street, Parramatta"),
            prompt("0412345678"),
            prompt("burst pipe flooding kitchen"),
            r#"{"type":"end","reason":"hangup"}"#.to_string(),
            r#"{"type":"end","reason":"hangup"}"#.to_string(),
        ];
        let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
        let (relay, sent) = FakeRelay::new(&frames);

        let exit = h.controller.run(relay, SessionMode::Inbound).await;
        assert_eq!(exit, SessionExit::RemoteEnded);

        let chunks = texts(&sent.lock().unwrap());
        assert_eq!(chunks[0], ("Thanks John.".to_string(), false));
        assert_eq!(chunks[1], (" What's your address?".to_string(), false));
        assert_eq!(chunks[2], (String::new(), true));

        let alerts = h.transport.bodies_to("+14165550199");
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].starts_with("URGENT LEAD"));
        assert!(alerts[0].contains("John Smith"));

        let lead = h.db.get_lead("+14165551234", "mikes").await.unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::New);
        assert!(lead.urgent);
        assert_eq!(h.llm.extraction_calls.load(Ordering::SeqCst), 1);

        let turns = h.db.get_conversation("+14165551234", "mikes").await.unwrap();
        assert_eq!(turns.len(), 8);
        assert_eq!(turns[1].text, "Thanks John. What's your address?");
    }

    #[tokio::test]
    async fn replayed_session_does_not_renotify() {
        let h = harness(vec![], Some(FULL_EXTRACTION)).await;
        for _ in 0..2 {
            let frames = [SETUP.to_string(), prompt("John Smith"), prompt("45 George St")];
            let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
            let (relay, _) = FakeRelay::new(&frames);
            h.controller.run(relay, SessionMode::Inbound).await;
        }
        assert_eq!(h.transport.bodies_to("+14165550199").len(), 1);
        assert_eq!(h.llm.extraction_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn name_only_sends_partial_alert() {
        let h = harness(vec![], Some(r#"{"name": "John Smith"}"#)).await;
        let frames = [SETUP.to_string(), prompt("John Smith")];
        let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
        let (relay, _) = FakeRelay::new(&frames);

        let exit = h.controller.run(relay, SessionMode::Inbound).await;
        assert_eq!(exit, SessionExit::Closed);

        let alerts = h.transport.bodies_to("+14165550199");
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains(INCOMPLETE_PROBLEM));
        assert!(alerts[0].contains("Name: John Smith"));
        assert!(h.db.get_lead("+14165551234", "mikes").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extraction_failure_still_alerts() {
        let h = harness(vec![], None).await;
        let frames = [SETUP.to_string(), prompt("hi"), prompt("my pipes are frozen, no heat")];
        let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
        let (relay, _) = FakeRelay::new(&frames);
        h.controller.run(relay, SessionMode::Inbound).await;

        let alerts = h.transport.bodies_to("+14165550199");
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].starts_with("URGENT LEAD"));
        assert!(alerts[0].contains(UNKNOWN_CALLER));
    }

    #[tokio::test]
    async fn agent_goodbye_hangs_up() {
        let h = harness(
            vec![Scripted::text(&[
                "Perfect. ",
                "Thanks for calling Mike's Emergency Plumbing, have a great day!",
            ])],
            Some(FULL_EXTRACTION),
        )
        .await;
        let frames = [SETUP.to_string(), prompt("that's all"), prompt("never read")];
        let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
        let (relay, sent) = FakeRelay::new(&frames);

        let exit = h.controller.run(relay, SessionMode::Inbound).await;
        assert_eq!(exit, SessionExit::AgentEnded);
        assert_eq!(sent.lock().unwrap().last(), Some(&RelayReply::End));
        assert_eq!(h.llm.reply_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generation_failure_sends_apology_and_continues() {
        let h = harness(
            vec![Scripted::Fail, Scripted::text(&["What's your address?"])],
            Some(FULL_EXTRACTION),
        )
        .await;
        let frames = [SETUP.to_string(), prompt("John"), prompt("hello?")];
        let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
        let (relay, sent) = FakeRelay::new(&frames);
        h.controller.run(relay, SessionMode::Inbound).await;

        let chunks = texts(&sent.lock().unwrap());
        assert_eq!(
            chunks[0],
            ("Sorry about that, let me get Mike to call you right back.".to_string(), true)
        );
        assert_eq!(chunks[1], ("What's your address?".to_string(), false));
        assert_eq!(chunks[2], (String::new(), true));
    }

    #[tokio::test]
    async fn stream_failure_keeps_emitted_text() {
        let h = harness(vec![Scripted::FailAfter(vec!["Oh no. ".into(), "Let".into()])], None).await;
        let frames = [SETUP.to_string(), prompt("burst pipe")];
        let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
        let (relay, sent) = FakeRelay::new(&frames);
        h.controller.run(relay, SessionMode::Inbound).await;

        let chunks = texts(&sent.lock().unwrap());
        assert_eq!(chunks[0], ("Oh no. ".to_string(), false));
        assert_eq!(chunks[1], ("Let".to_string(), false));
        assert!(chunks[2].1);

        let turns = h.db.get_conversation("+14165551234", "mikes").await.unwrap();
        assert!(turns[1].text.starts_with("Oh no. Let Sorry about that"));
    }

    #[tokio::test]
    async fn malformed_and_early_events_are_ignored() {
        let h = harness(vec![], None).await;
        let frames = [
            "not json".to_string(),
            prompt("before setup"),
            SETUP.to_string(),
            r#"{"type":"dtmf","digit":"5"}"#.to_string(),
            r#"{"type":"interrupt"}"#.to_string(),
        ];
        let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
        let (relay, sent) = FakeRelay::new(&frames);

        let exit = h.controller.run(relay, SessionMode::Inbound).await;
        assert_eq!(exit, SessionExit::Closed);
        assert!(sent.lock().unwrap().is_empty());
        assert!(h.transport.messages().is_empty());
    }

    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionObserver for RecordingObserver {
        async fn demo_connected(&self, prospect_phone: &str) {
            self.events.lock().unwrap().push(format!("connected {prospect_phone}"));
        }

        async fn demo_closed(&self, prospect_phone: &str) {
            self.events.lock().unwrap().push(format!("closed {prospect_phone}"));
        }
    }

    #[tokio::test]
    async fn demo_mode_impersonates_prospect() {
        let h = harness(vec![], Some(FULL_EXTRACTION)).await;
        h.db.upsert_demo_session(&DemoSession {
            prospect_phone: "+16475550123".into(),
            business_name: "Cool Air HVAC".into(),
            owner_name: "Dana".into(),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        })
        .await
        .unwrap();

        let observer = Arc::new(RecordingObserver {
            events: Mutex::new(Vec::new()),
        });
        let controller = h.controller.with_observer(observer.clone());

        let frames = [
            r#"{"type":"setup","callSid":"CA9","from":"+15550001111","to":"+16475550123"}"#.to_string(),
            prompt("Hi, my furnace died"),
        ];
        let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
        let (relay, _) = FakeRelay::new(&frames);
        controller.run(relay, SessionMode::Demo).await;

        assert_eq!(
            *observer.events.lock().unwrap(),
            vec!["connected +16475550123", "closed +16475550123"]
        );
        // The prospect plays operator and gets the alert.
        assert_eq!(h.transport.bodies_to("+16475550123").len(), 1);
        let turns = h.db.get_conversation("+16475550123", "demo:+16475550123").await.unwrap();
        assert_eq!(turns.len(), 2);
    }

    #[tokio::test]
    async fn idle_timeout_still_finalizes_once() {
        let h = harness_with(
            vec![],
            None,
            SessionConfig {
                idle_timeout: Duration::from_millis(50),
                ..SessionConfig::default()
            },
        )
        .await;
        let first = prompt("no heat upstairs");
        let (relay, _sent) = FakeRelay::with_tail(&[SETUP, first.as_str()], Tail::Stall);

        let exit = h.controller.run(relay, SessionMode::Inbound).await;
        assert_eq!(exit, SessionExit::IdleTimeout);

        let alerts = h.transport.bodies_to("+14165550199");
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].starts_with("URGENT LEAD"));
        assert!(alerts[0].contains(INCOMPLETE_PROBLEM));
    }

    #[tokio::test]
    async fn broken_socket_still_finalizes_once() {
        let h = harness(vec![], None).await;
        let first = prompt("my furnace is making a noise");

        let (relay, _sent) = FakeRelay::with_tail(&[SETUP, first.as_str()], Tail::Fail);
        let exit = h.controller.run(relay, SessionMode::Inbound).await;
        assert!(matches!(exit, SessionExit::ChannelFailed(_)));

        // The relay reconnects on the same call and breaks again.
        let (relay, _sent) = FakeRelay::with_tail(&[SETUP, first.as_str()], Tail::Fail);
        let exit = h.controller.run(relay, SessionMode::Inbound).await;
        assert!(matches!(exit, SessionExit::ChannelFailed(_)));

        let alerts = h.transport.bodies_to("+14165550199");
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].starts_with("MISSED CALL"));
        assert!(alerts[0].contains("Phone: +14165551234"));
    }
}
