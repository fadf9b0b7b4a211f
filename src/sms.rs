//! Inbound text messages.
//!
//! One entry point routes each text to the operator command handler, the
//! outbound campaign, or the conversational receptionist.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::leads::commands::CommandHandler;
use crate::leads::extractor::LeadExtractor;
use crate::leads::model::{Lead, LeadChannel, LeadStatus, SessionKey, Speaker, Tenant, Turn};
use crate::leads::notify::{LeadAlert, NotificationDispatcher};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::nurture::NurtureEngine;
use crate::prompts;
use crate::store::Database;

const OPERATOR_ERROR_REPLY: &str = "Sorry, that didn't work. Please try again in a minute.";

pub struct SmsResponder {
    db: Arc<dyn Database>,
    llm: Arc<dyn LlmProvider>,
    extractor: Arc<LeadExtractor>,
    dispatcher: Arc<NotificationDispatcher>,
    commands: CommandHandler,
    nurture: Option<Arc<NurtureEngine>>,
    config: SessionConfig,
    default_tenant: Tenant,
}

impl SmsResponder {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        extractor: Arc<LeadExtractor>,
        dispatcher: Arc<NotificationDispatcher>,
        commands: CommandHandler,
        config: SessionConfig,
        default_tenant: Tenant,
    ) -> Self {
        Self {
            db,
            llm,
            extractor,
            dispatcher,
            commands,
            nurture: None,
            config,
            default_tenant,
        }
    }

    /// Route replies from campaign prospects to the nurture engine.
    pub fn with_nurture(mut self, engine: Arc<NurtureEngine>) -> Self {
        self.nurture = Some(engine);
        self
    }

    /// Handle one inbound text. Returns the reply body; empty means no reply.
    pub async fn handle(&self, from: &str, to: &str, body: &str) -> String {
        let tenant = self.resolve_tenant(to).await;
        info!(from, tenant = %tenant.id, "Inbound text");

        if tenant.is_operator(from) {
            return match self.commands.handle(&tenant, body).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(tenant = %tenant.id, error = %e, "Operator command failed");
                    OPERATOR_ERROR_REPLY.to_string()
                }
            };
        }

        if let Some(engine) = &self.nurture {
            match self.db.get_prospect(from).await {
                Ok(Some(_)) => {
                    match engine.handle_reply(from, body).await {
                        Ok(outcome) => debug!(from, ?outcome, "Prospect reply handled"),
                        Err(e) => warn!(from, error = %e, "Prospect reply failed"),
                    }
                    return String::new();
                }
                Ok(None) => {}
                Err(e) => warn!(from, error = %e, "Prospect lookup failed"),
            }
        }

        let body = body.trim();
        if body.is_empty() {
            return String::new();
        }
        self.converse(&tenant, from, to, body).await
    }

    async fn resolve_tenant(&self, to: &str) -> Tenant {
        match self.db.get_tenant_by_address(to).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) => self.default_tenant.clone(),
            Err(e) => {
                error!(error = %e, "Tenant lookup failed; using default tenant");
                self.default_tenant.clone()
            }
        }
    }

    async fn converse(&self, tenant: &Tenant, from: &str, to: &str, body: &str) -> String {
        if let Err(e) = self.db.append_turn(from, &tenant.id, &Turn::customer(body)).await {
            error!(from, error = %e, "Failed to persist text");
        }

        let turns = match self.db.get_conversation(from, &tenant.id).await {
            Ok(turns) => turns,
            Err(e) => {
                error!(from, error = %e, "Failed to load conversation");
                vec![Turn::customer(body)]
            }
        };

        let reply = match self.generate(tenant, &turns).await {
            Some(reply) => {
                if let Err(e) = self.db.append_turn(from, &tenant.id, &Turn::agent(reply.clone())).await {
                    error!(from, error = %e, "Failed to persist reply");
                }
                reply
            }
            None => prompts::sms_fallback(tenant),
        };

        self.capture_lead(tenant, from, to).await;
        reply
    }

    async fn generate(&self, tenant: &Tenant, turns: &[Turn]) -> Option<String> {
        let mut messages = vec![ChatMessage::system(prompts::sms_system_prompt(tenant))];
        messages.extend(turns.iter().map(|t| match t.speaker {
            Speaker::Customer => ChatMessage::user(t.text.clone()),
            Speaker::Agent => ChatMessage::assistant(t.text.clone()),
        }));
        let request = CompletionRequest::new(messages)
            .with_max_tokens(self.config.reply_max_tokens)
            .with_temperature(self.config.reply_temperature);

        match tokio::time::timeout(self.config.generation_timeout, self.llm.complete(request)).await {
            Ok(Ok(response)) if !response.content.trim().is_empty() => {
                Some(response.content.trim().to_string())
            }
            Ok(Ok(_)) => {
                warn!("Empty text reply; using fallback");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Text reply failed; using fallback");
                None
            }
            Err(_) => {
                warn!("Text reply timed out; using fallback");
                None
            }
        }
    }

    /// Store and report a captured lead, at most once per sender per day.
    async fn capture_lead(&self, tenant: &Tenant, from: &str, to: &str) {
        let key = SessionKey::new(from, to, format!("sms:{}", Utc::now().format("%Y-%m-%d")));
        match self.db.is_session_notified(&key).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => warn!(from, error = %e, "Notification lookup failed"),
        }

        let turns = match self.db.get_conversation(from, &tenant.id).await {
            Ok(turns) => turns,
            Err(e) => {
                error!(from, error = %e, "Failed to load conversation");
                return;
            }
        };
        let extraction = match self.extractor.extract(&turns).await {
            Ok(Some(extraction)) if extraction.captured => extraction,
            Ok(_) => return,
            Err(e) => {
                warn!(from, error = %e, "Lead extraction failed");
                return;
            }
        };

        let alert = LeadAlert {
            urgent: extraction.urgent,
            partial: false,
            channel: LeadChannel::Sms,
            name: extraction.name.clone().unwrap_or_default(),
            address: extraction.address.clone(),
            contact_phone: extraction.phone.clone().unwrap_or_else(|| from.to_string()),
            problem: extraction
                .problem
                .clone()
                .unwrap_or_else(|| "No details given".to_string()),
        };
        match self
            .dispatcher
            .claim(&key, &tenant.owner_phone, &tenant.transport_address, &alert)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(from, error = %e, "Could not claim text session");
                return;
            }
        }

        let now = Utc::now();
        let lead = Lead {
            phone: from.to_string(),
            tenant_id: tenant.id.clone(),
            name: extraction.name,
            address: extraction.address,
            contact_phone: extraction.phone,
            problem: extraction.problem,
            urgent: extraction.urgent,
            channel: LeadChannel::Sms,
            status: LeadStatus::New,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.db.upsert_lead(&lead).await {
            error!(from, error = %e, "Failed to store lead");
        }

        if let Err(e) = self
            .dispatcher
            .deliver(&key, &tenant.owner_phone, &tenant.transport_address, &alert)
            .await
        {
            error!(from, error = %e, "Failed to record alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::config::{NurtureConfig, UrgencyPolicy};
    use crate::nurture::{Prospect, ProspectStatus, Templates};
    use crate::store::LibSqlBackend;
    use crate::testing::{self, FULL_EXTRACTION, RecordingTransport, Scripted, ScriptedLlm};

    struct Harness {
        sms: SmsResponder,
        db: Arc<dyn Database>,
        transport: Arc<RecordingTransport>,
        llm: Arc<ScriptedLlm>,
    }

    async fn harness(replies: Vec<Scripted>, extraction: Option<&str>) -> Harness {
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
        let sms = SmsResponder::new(
            db.clone(),
            llm.clone(),
            extractor,
            dispatcher,
            CommandHandler::new(db.clone(), transport.clone()),
            SessionConfig::default(),
            testing::tenant(),
        );
        Harness {
            sms,
            db,
            transport,
            llm,
        }
    }

    const CUSTOMER: &str = "+14165551234";
    const OURS: &str = "+15550001111";

    #[tokio::test]
    async fn customer_text_gets_generated_reply() {
        let h = harness(vec![Scripted::text(&["Sorry to hear that! What's your name?"])], None).await;
        let reply = h.sms.handle(CUSTOMER, OURS, "my furnace died").await;
        assert_eq!(reply, "Sorry to hear that! What's your name?");
        let turns = h.db.get_conversation(CUSTOMER, "mikes").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].speaker, Speaker::Agent);
    }

    #[tokio::test]
    async fn generation_failure_uses_fallback() {
        let h = harness(vec![Scripted::Fail], None).await;
        let reply = h.sms.handle(CUSTOMER, OURS, "hello").await;
        assert_eq!(reply, "Thanks for reaching out. Mike will call you back shortly.");
    }

    #[tokio::test]
    async fn captured_lead_notifies_once_per_day() {
        let h = harness(vec![], Some(FULL_EXTRACTION)).await;
        h.sms.handle(CUSTOMER, OURS, "burst pipe flooding the kitchen, John Smith").await;
        h.sms.handle(CUSTOMER, OURS, "45 George Street, 0412345678").await;

        let alerts = h.transport.bodies_to("+14165550199");
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].starts_with("URGENT LEAD via sms"));
        let lead = h.db.get_lead(CUSTOMER, "mikes").await.unwrap().unwrap();
        assert_eq!(lead.channel, LeadChannel::Sms);
        // Second text skips extraction once the day's alert is out.
        assert_eq!(h.llm.extraction_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn operator_text_runs_commands() {
        let h = harness(vec![], None).await;
        let reply = h.sms.handle("+1 416 555 0199", OURS, "LEADS").await;
        assert_eq!(reply, "No leads yet.");
        assert_eq!(h.llm.reply_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prospect_reply_goes_to_campaign() {
        let h = harness(vec![], None).await;
        let engine = Arc::new(NurtureEngine::new(
            h.db.clone(),
            h.transport.clone(),
            NurtureConfig {
                send_spacing: Duration::ZERO,
                ..NurtureConfig::default()
            },
            Templates::new("Ontario", "https://t.test/trial", "https://t.test/pay"),
            OURS,
        ));
        engine
            .register(&Prospect::new("+16475550123", "Cool Air HVAC"))
            .await
            .unwrap();
        engine.send_initial("+16475550123").await.unwrap();

        let sms = h.sms.with_nurture(engine);
        let reply = sms.handle("+16475550123", OURS, "YES").await;
        assert!(reply.is_empty());
        let p = h.db.get_prospect("+16475550123").await.unwrap().unwrap();
        assert_eq!(p.status, ProspectStatus::Responded);
        assert_eq!(h.llm.reply_calls.load(Ordering::SeqCst), 0);
    }
}
