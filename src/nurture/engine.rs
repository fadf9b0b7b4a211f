//! Outbound nurture engine.
//!
//! Moves prospects through the campaign funnel. Every transition for a
//! prospect runs under that prospect's lock and is written with a
//! conditional update on the status it was read in, so replies, call-status
//! callbacks and the ticker never interleave on the same prospect.
//! Pending steps are stored as `next_follow_up_at`, so a restart resumes
//! them on the next tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::NurtureConfig;
use crate::error::NurtureError;
use crate::nurture::model::{
    DemoSession, Prospect, ProspectStatus, ReplyIntent, classify_reply,
};
use crate::nurture::templates::Templates;
use crate::prompts;
use crate::session::SessionObserver;
use crate::store::Database;
use crate::transport::{RelayDocument, Transport};

/// Owner name spoken in demo greetings when the prospect gave none.
const DEFAULT_DEMO_OWNER: &str = "our technician";

/// Upper bound on prospects re-invited by one manual retry run.
const RETRY_SCAN_LIMIT: usize = 500;

/// Counts returned by batch operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub sent: usize,
    pub failed: usize,
}

impl BatchResult {
    fn record(&mut self, sent: bool) {
        if sent {
            self.sent += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub initial: BatchResult,
    pub follow_ups: BatchResult,
    pub demo_calls: BatchResult,
    pub missed_demos: BatchResult,
    pub trial_offers: BatchResult,
    pub no_answer_retries: BatchResult,
    pub trial_messages: BatchResult,
    pub demo_sessions_purged: usize,
}

/// How an inbound text from a prospect was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Demo call scheduled.
    DemoScheduled,
    TrialStarted,
    /// Nothing to do in the prospect's current state.
    Ignored,
}

pub struct NurtureEngine {
    db: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    config: NurtureConfig,
    templates: Templates,
    /// Number campaign messages and demo calls come from.
    from_number: String,
    language: String,
    hints: Vec<String>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NurtureEngine {
    pub fn new(
        db: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        config: NurtureConfig,
        templates: Templates,
        from_number: impl Into<String>,
    ) -> Self {
        Self {
            db,
            transport,
            config,
            templates,
            from_number: from_number.into(),
            language: "en-US".to_string(),
            hints: Vec::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Speech settings for demo calls.
    pub fn with_speech(mut self, language: impl Into<String>, hints: Vec<String>) -> Self {
        self.language = language.into();
        self.hints = hints;
        self
    }

    pub fn config(&self) -> &NurtureConfig {
        &self.config
    }

    // ── Locking ─────────────────────────────────────────────────────

    async fn lock(&self, phone: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop locks nobody else holds so the map stays small.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(phone.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn load(&self, phone: &str) -> Result<Prospect, NurtureError> {
        self.db
            .get_prospect(phone)
            .await?
            .ok_or_else(|| NurtureError::NotFound {
                phone: phone.to_string(),
            })
    }

    /// Persist `next` if the stored prospect is still in `expected`.
    async fn commit(
        &self,
        expected: ProspectStatus,
        mut next: Prospect,
        now: DateTime<Utc>,
    ) -> Result<Prospect, NurtureError> {
        if expected != next.status && !expected.can_transition_to(next.status) {
            return Err(NurtureError::InvalidTransition {
                phone: next.phone.clone(),
                state: expected.to_string(),
                target: next.status.to_string(),
            });
        }
        next.updated_at = now;
        if !self.db.update_prospect(expected, &next).await? {
            return Err(NurtureError::Conflict { phone: next.phone });
        }
        Ok(next)
    }

    async fn event(&self, phone: &str, event: &str, detail: Option<&str>) {
        if let Err(e) = self.db.log_outbound_event(phone, event, detail).await {
            warn!(phone, event, error = %e, "Failed to log outbound event");
        }
    }

    /// Text a prospect. Returns the message id, or None after logging the failure.
    async fn text(&self, phone: &str, body: &str, event: &str) -> Option<String> {
        match self
            .transport
            .send_message(phone, &self.from_number, body)
            .await
        {
            Ok(sid) => {
                self.event(phone, event, Some(&format!("SID: {sid}"))).await;
                Some(sid)
            }
            Err(e) => {
                warn!(phone, event, error = %e, "Campaign message failed");
                self.event(phone, "sms_failed", Some(&format!("{event}: {e}"))).await;
                None
            }
        }
    }

    async fn pause(&self) {
        if !self.config.send_spacing.is_zero() {
            tokio::time::sleep(self.config.send_spacing).await;
        }
    }

    // ── Registration and first contact ──────────────────────────────

    /// Add a prospect. Returns false if the phone is already registered.
    pub async fn register(&self, prospect: &Prospect) -> Result<bool, NurtureError> {
        let inserted = self.db.insert_prospect(prospect).await?;
        if inserted {
            self.event(&prospect.phone, "registered", Some(&prospect.business_name))
                .await;
            info!(phone = %prospect.phone, business = %prospect.business_name, "Prospect registered");
        }
        Ok(inserted)
    }

    pub async fn list_prospects(&self) -> Result<Vec<Prospect>, NurtureError> {
        Ok(self.db.list_prospects().await?)
    }

    /// Send the initial message to a pending prospect.
    pub async fn send_initial(&self, phone: &str) -> Result<bool, NurtureError> {
        let _guard = self.lock(phone).await;
        let prospect = self.load(phone).await?;
        if prospect.status != ProspectStatus::Pending {
            return Err(NurtureError::InvalidTransition {
                phone: phone.to_string(),
                state: prospect.status.to_string(),
                target: ProspectStatus::Contacted.to_string(),
            });
        }
        self.contact(prospect, Utc::now()).await
    }

    async fn contact(&self, prospect: Prospect, now: DateTime<Utc>) -> Result<bool, NurtureError> {
        let body = self.templates.initial(&prospect);
        if self.text(&prospect.phone, &body, "sms_initial").await.is_none() {
            return Ok(false);
        }
        let next = Prospect {
            status: ProspectStatus::Contacted,
            sms_sent: true,
            next_follow_up_at: Some(now + self.config.follow_up_interval),
            last_follow_up_at: Some(now),
            ..prospect
        };
        self.commit(ProspectStatus::Pending, next, now).await?;
        Ok(true)
    }

    /// Initial contact for up to `limit` pending prospects.
    pub async fn send_batch(&self, limit: usize) -> Result<BatchResult, NurtureError> {
        self.send_batch_at(limit, Utc::now()).await
    }

    async fn send_batch_at(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<BatchResult, NurtureError> {
        let pending = self
            .db
            .list_prospects_by_status(ProspectStatus::Pending, limit)
            .await?;

        let mut result = BatchResult::default();
        for candidate in pending {
            let _guard = self.lock(&candidate.phone).await;
            let prospect = match self.db.get_prospect(&candidate.phone).await? {
                Some(p) if p.status == ProspectStatus::Pending && !p.sms_sent => p,
                _ => continue,
            };
            let sent = self.step(&candidate.phone, self.contact(prospect, now)).await;
            result.record(sent);
            if sent {
                self.pause().await;
            }
        }
        if result.sent + result.failed > 0 {
            info!(sent = result.sent, failed = result.failed, "Initial batch sent");
        }
        Ok(result)
    }

    /// Run one per-prospect step, logging instead of aborting the batch.
    async fn step<F>(&self, phone: &str, fut: F) -> bool
    where
        F: std::future::Future<Output = Result<bool, NurtureError>>,
    {
        match fut.await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(phone, error = %e, "Campaign step skipped");
                false
            }
        }
    }

    // ── Follow-ups ──────────────────────────────────────────────────

    /// Send follow-ups that are due now.
    pub async fn process_followups(&self) -> Result<BatchResult, NurtureError> {
        self.process_followups_at(Utc::now()).await
    }

    async fn process_followups_at(&self, now: DateTime<Utc>) -> Result<BatchResult, NurtureError> {
        let due = self
            .db
            .list_due_prospects(ProspectStatus::Contacted, now)
            .await?;

        let mut result = BatchResult::default();
        for candidate in due {
            let _guard = self.lock(&candidate.phone).await;
            let prospect = match self.db.get_prospect(&candidate.phone).await? {
                Some(p) if p.status == ProspectStatus::Contacted && p.is_due(now) => p,
                _ => continue,
            };
            let sent = self.step(&candidate.phone, self.follow_up(prospect, now)).await;
            result.record(sent);
            if sent {
                self.pause().await;
            }
        }
        Ok(result)
    }

    async fn follow_up(&self, prospect: Prospect, now: DateTime<Utc>) -> Result<bool, NurtureError> {
        let max = self.config.max_follow_ups;
        if prospect.follow_up_count >= max {
            let phone = prospect.phone.clone();
            let next = Prospect {
                status: ProspectStatus::Dead,
                next_follow_up_at: None,
                ..prospect
            };
            self.commit(ProspectStatus::Contacted, next, now).await?;
            self.event(&phone, "marked_dead", Some("Max follow-ups reached"))
                .await;
            return Ok(false);
        }

        let n = prospect.follow_up_count + 1;
        let body = self.templates.follow_up(&prospect, n);
        let event = format!("sms_followup_{n}");
        if self.text(&prospect.phone, &body, &event).await.is_none() {
            return Ok(false);
        }

        let exhausted = n >= max;
        let phone = prospect.phone.clone();
        let next = Prospect {
            follow_up_count: n,
            last_follow_up_at: Some(now),
            next_follow_up_at: (!exhausted).then(|| now + self.config.follow_up_interval),
            status: if exhausted {
                ProspectStatus::Dead
            } else {
                ProspectStatus::Contacted
            },
            ..prospect
        };
        self.commit(ProspectStatus::Contacted, next, now).await?;
        if exhausted {
            info!(phone = %phone, "Follow-ups exhausted; prospect marked dead");
            self.event(&phone, "marked_dead", Some("Max follow-ups reached"))
                .await;
        }
        Ok(true)
    }

    // ── Replies ─────────────────────────────────────────────────────

    /// Handle an inbound text from a registered prospect.
    pub async fn handle_reply(
        self: &Arc<Self>,
        phone: &str,
        body: &str,
    ) -> Result<ReplyOutcome, NurtureError> {
        let intent = classify_reply(
            body,
            &self.config.affirmative_keywords,
            &self.config.trial_keywords,
        );
        let now = Utc::now();
        let _guard = self.lock(phone).await;
        let prospect = self.load(phone).await?;
        self.event(phone, "reply", Some(body.trim())).await;

        match intent {
            ReplyIntent::Affirmative => {
                let status = prospect.status;
                if status.is_demo_in_flight() || !status.can_transition_to(ProspectStatus::Responded)
                {
                    debug!(phone, %status, "Affirmative reply ignored");
                    return Ok(ReplyOutcome::Ignored);
                }
                let body = self.templates.yes_received(&prospect);
                let demo_delay = chrono::Duration::from_std(self.config.demo_call_delay)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                // The timer lets a later tick place the call if this process
                // never gets to it.
                let next = Prospect {
                    status: ProspectStatus::Responded,
                    responded: true,
                    next_follow_up_at: Some(now + demo_delay),
                    ..prospect
                };
                self.commit(status, next, now).await?;
                self.event(phone, "responded_yes", None).await;
                self.text(phone, &body, "sms_yes_received").await;
                info!(phone, "Prospect opted in to a demo call");

                let engine = Arc::clone(self);
                let phone = phone.to_string();
                let delay = self.config.demo_call_delay;
                tokio::spawn(async move {
                    // Let the confirmation text land before the phone rings.
                    tokio::time::sleep(delay).await;
                    if let Err(e) = engine.run_demo_call(&phone).await {
                        error!(phone = %phone, error = %e, "Demo call failed");
                    }
                });
                Ok(ReplyOutcome::DemoScheduled)
            }
            ReplyIntent::Trial => {
                let status = prospect.status;
                if !status.can_transition_to(ProspectStatus::Trial) || status == ProspectStatus::Trial
                {
                    debug!(phone, %status, "Trial reply ignored");
                    return Ok(ReplyOutcome::Ignored);
                }
                let body = self.templates.trial_started(&prospect);
                let next = Prospect {
                    status: ProspectStatus::Trial,
                    trial_activated: true,
                    trial_started_at: Some(now),
                    trial_reminder_sent: false,
                    next_follow_up_at: Some(now + self.config.trial_reminder_after),
                    ..prospect
                };
                self.commit(status, next, now).await?;
                self.event(phone, "trial_started", None).await;
                self.text(phone, &body, "sms_trial_started").await;
                info!(phone, "Trial activated");
                Ok(ReplyOutcome::TrialStarted)
            }
            ReplyIntent::Other => Ok(ReplyOutcome::Ignored),
        }
    }

    // ── Demo calls ──────────────────────────────────────────────────

    /// Place the demo call for a prospect who opted in.
    pub async fn run_demo_call(&self, phone: &str) -> Result<bool, NurtureError> {
        let _guard = self.lock(phone).await;
        let prospect = self.load(phone).await?;
        if prospect.status != ProspectStatus::Responded {
            debug!(phone, status = %prospect.status, "Demo call no longer wanted");
            return Ok(false);
        }
        self.place_demo_call(prospect, Utc::now()).await
    }

    /// Caller holds the prospect lock and has checked the status.
    async fn place_demo_call(&self, prospect: Prospect, now: DateTime<Utc>) -> Result<bool, NurtureError> {
        let phone: &str = &prospect.phone.clone();
        let owner = prospect
            .owner_name
            .clone()
            .filter(|o| !o.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DEMO_OWNER.to_string());

        // The demo agent starts with no memory of earlier calls.
        let demo_tenant = format!("demo:{phone}");
        match self.db.clear_conversation(phone, &demo_tenant).await {
            Ok(n) if n > 0 => debug!(phone, cleared = n, "Cleared demo history"),
            Ok(_) => {}
            Err(e) => warn!(phone, error = %e, "Failed to clear demo history"),
        }

        self.db
            .upsert_demo_session(&DemoSession {
                prospect_phone: phone.to_string(),
                business_name: prospect.business_name.clone(),
                owner_name: owner.clone(),
                expires_at: now + self.config.demo_session_ttl,
            })
            .await?;

        let relay = RelayDocument::new(
            self.config.demo_relay_url.clone(),
            prompts::demo_welcome_greeting(&prospect.business_name, &owner),
        )
        .with_language(self.language.clone())
        .with_hints(self.hints.clone());

        match self
            .transport
            .originate_call(phone, &self.from_number, &relay)
            .await
        {
            Ok(sid) => {
                let next = Prospect {
                    status: ProspectStatus::DemoCalled,
                    demo_called: true,
                    next_follow_up_at: Some(now + self.config.post_call_wait),
                    ..prospect
                };
                self.commit(ProspectStatus::Responded, next, now).await?;
                self.event(phone, "demo_called", Some(&format!("SID: {sid}")))
                    .await;
                info!(phone, sid = %sid, "Demo call placed");
                Ok(true)
            }
            Err(e) => {
                warn!(phone, error = %e, "Demo call origination failed");
                self.event(phone, "demo_call_failed", Some(&e.to_string()))
                    .await;
                if let Err(e) = self.db.delete_demo_session(phone).await {
                    warn!(phone, error = %e, "Failed to remove demo session");
                }
                let retry_at = now + self.config.follow_up_interval;
                let next = Prospect {
                    next_follow_up_at: Some(retry_at),
                    ..prospect
                };
                self.commit(ProspectStatus::Responded, next, now).await?;
                debug!(phone, %retry_at, "Demo call rescheduled");
                Ok(false)
            }
        }
    }

    /// The prospect picked up.
    pub async fn mark_demo_answered(&self, phone: &str) -> Result<bool, NurtureError> {
        let _guard = self.lock(phone).await;
        let prospect = self.load(phone).await?;
        let status = prospect.status;
        if !matches!(status, ProspectStatus::Responded | ProspectStatus::DemoCalled) {
            return Ok(false);
        }
        let now = Utc::now();
        let next = Prospect {
            status: ProspectStatus::DemoAnswered,
            demo_answered: true,
            next_follow_up_at: Some(now + self.config.post_call_wait),
            ..prospect
        };
        self.commit(status, next, now).await?;
        self.event(phone, "demo_answered", None).await;
        info!(phone, "Demo call answered");
        Ok(true)
    }

    /// Apply a carrier call-status callback for a demo call.
    pub async fn handle_call_status(&self, phone: &str, call_status: &str) -> Result<bool, NurtureError> {
        match call_status {
            "no-answer" | "busy" | "failed" | "canceled" => {
                let _guard = self.lock(phone).await;
                let prospect = self.load(phone).await?;
                if !matches!(
                    prospect.status,
                    ProspectStatus::Responded | ProspectStatus::DemoCalled
                ) {
                    return Ok(false);
                }
                self.missed_demo(prospect, Utc::now(), call_status).await
            }
            "in-progress" | "answered" => self.mark_demo_answered(phone).await,
            other => {
                debug!(phone, status = other, "Call status ignored");
                Ok(false)
            }
        }
    }

    async fn missed_demo(
        &self,
        prospect: Prospect,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, NurtureError> {
        let phone = prospect.phone.clone();
        let expected = prospect.status;
        let body = self.templates.no_answer_retry(&prospect);
        let next = Prospect {
            status: ProspectStatus::NoAnswer,
            last_follow_up_at: Some(now),
            next_follow_up_at: Some(now + self.config.follow_up_interval),
            ..prospect
        };
        self.commit(expected, next, now).await?;
        self.event(&phone, "demo_no_answer", Some(reason)).await;
        if let Err(e) = self.db.delete_demo_session(&phone).await {
            warn!(phone = %phone, error = %e, "Failed to remove demo session");
        }
        Ok(self.text(&phone, &body, "sms_no_answer_retry").await.is_some())
    }

    async fn offer_trial(&self, prospect: Prospect, now: DateTime<Utc>) -> Result<bool, NurtureError> {
        let body = self.templates.after_demo(&prospect);
        if self.text(&prospect.phone, &body, "sms_after_demo").await.is_none() {
            return Ok(false);
        }
        let phone = prospect.phone.clone();
        let next = Prospect {
            status: ProspectStatus::DemoDone,
            next_follow_up_at: None,
            ..prospect
        };
        self.commit(ProspectStatus::DemoAnswered, next, now).await?;
        if let Err(e) = self.db.delete_demo_session(&phone).await {
            warn!(phone = %phone, error = %e, "Failed to remove demo session");
        }
        Ok(true)
    }

    /// Re-invite every prospect whose demo call went unanswered.
    pub async fn retry_no_answers(&self) -> Result<BatchResult, NurtureError> {
        let now = Utc::now();
        let prospects = self
            .db
            .list_prospects_by_status(ProspectStatus::NoAnswer, RETRY_SCAN_LIMIT)
            .await?;
        self.retry_each(prospects, now).await
    }

    async fn retry_each(
        &self,
        prospects: Vec<Prospect>,
        now: DateTime<Utc>,
    ) -> Result<BatchResult, NurtureError> {
        let mut result = BatchResult::default();
        for candidate in prospects {
            let _guard = self.lock(&candidate.phone).await;
            let prospect = match self.db.get_prospect(&candidate.phone).await? {
                Some(p) if p.status == ProspectStatus::NoAnswer => p,
                _ => continue,
            };
            let sent = self.step(&candidate.phone, self.retry_no_answer(prospect, now)).await;
            result.record(sent);
            if sent {
                self.pause().await;
            }
        }
        Ok(result)
    }

    async fn retry_no_answer(&self, prospect: Prospect, now: DateTime<Utc>) -> Result<bool, NurtureError> {
        let body = self.templates.no_answer_retry(&prospect);
        if self.text(&prospect.phone, &body, "no_answer_retry").await.is_none() {
            return Ok(false);
        }
        let next = Prospect {
            last_follow_up_at: Some(now),
            next_follow_up_at: Some(now + self.config.follow_up_interval),
            ..prospect
        };
        self.commit(ProspectStatus::NoAnswer, next, now).await?;
        Ok(true)
    }

    // ── Trial and payment ───────────────────────────────────────────

    async fn trial_checkpoint(&self, prospect: Prospect, now: DateTime<Utc>) -> Result<bool, NurtureError> {
        let Some(started) = prospect.trial_started_at else {
            warn!(phone = %prospect.phone, "Trial without a start time");
            return Ok(false);
        };
        let ends = started + self.config.trial_length;

        if now >= ends {
            let body = self.templates.trial_day7(&prospect);
            if self.text(&prospect.phone, &body, "sms_trial_day7").await.is_none() {
                return Ok(false);
            }
            let phone = prospect.phone.clone();
            let next = Prospect {
                status: ProspectStatus::Dead,
                next_follow_up_at: None,
                ..prospect
            };
            self.commit(ProspectStatus::Trial, next, now).await?;
            self.event(&phone, "trial_expired", None).await;
            return Ok(true);
        }

        if !prospect.trial_reminder_sent {
            let body = self.templates.trial_day5(&prospect);
            if self.text(&prospect.phone, &body, "sms_trial_day5").await.is_none() {
                return Ok(false);
            }
            let next = Prospect {
                trial_reminder_sent: true,
                next_follow_up_at: Some(ends),
                ..prospect
            };
            self.commit(ProspectStatus::Trial, next, now).await?;
            return Ok(true);
        }

        // Reminder already out; wait for the end of the trial.
        let next = Prospect {
            next_follow_up_at: Some(ends),
            ..prospect
        };
        self.commit(ProspectStatus::Trial, next, now).await?;
        Ok(false)
    }

    /// Record payment: trial, or a lapsed trial, becomes paid.
    pub async fn mark_paid(&self, phone: &str) -> Result<Prospect, NurtureError> {
        let _guard = self.lock(phone).await;
        let prospect = self.load(phone).await?;
        let status = prospect.status;
        let allowed = match status {
            ProspectStatus::Trial => true,
            ProspectStatus::Dead => prospect.trial_activated,
            _ => false,
        };
        if !allowed {
            return Err(NurtureError::InvalidTransition {
                phone: phone.to_string(),
                state: status.to_string(),
                target: ProspectStatus::Paid.to_string(),
            });
        }
        let next = Prospect {
            status: ProspectStatus::Paid,
            next_follow_up_at: None,
            ..prospect
        };
        let paid = self.commit(status, next, Utc::now()).await?;
        self.event(phone, "paid", None).await;
        info!(phone, "Prospect converted");
        Ok(paid)
    }

    // ── Ticker ──────────────────────────────────────────────────────

    /// Run every scheduled step that is due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, NurtureError> {
        let mut report = TickReport {
            initial: self.send_batch_at(self.config.batch_size, now).await?,
            follow_ups: self.process_followups_at(now).await?,
            ..TickReport::default()
        };

        for candidate in self.db.list_due_prospects(ProspectStatus::Responded, now).await? {
            let _guard = self.lock(&candidate.phone).await;
            let prospect = match self.db.get_prospect(&candidate.phone).await? {
                Some(p) if p.status == ProspectStatus::Responded && p.is_due(now) => p,
                _ => continue,
            };
            let placed = self
                .step(&candidate.phone, self.place_demo_call(prospect, now))
                .await;
            report.demo_calls.record(placed);
        }

        for candidate in self.db.list_due_prospects(ProspectStatus::DemoCalled, now).await? {
            let _guard = self.lock(&candidate.phone).await;
            let prospect = match self.db.get_prospect(&candidate.phone).await? {
                Some(p) if p.status == ProspectStatus::DemoCalled && p.is_due(now) => p,
                _ => continue,
            };
            let sent = self
                .step(&candidate.phone, self.missed_demo(prospect, now, "no pickup"))
                .await;
            report.missed_demos.record(sent);
        }

        for candidate in self.db.list_due_prospects(ProspectStatus::DemoAnswered, now).await? {
            let _guard = self.lock(&candidate.phone).await;
            let prospect = match self.db.get_prospect(&candidate.phone).await? {
                Some(p) if p.status == ProspectStatus::DemoAnswered && p.is_due(now) => p,
                _ => continue,
            };
            let sent = self.step(&candidate.phone, self.offer_trial(prospect, now)).await;
            report.trial_offers.record(sent);
        }

        let no_answers = self
            .db
            .list_due_prospects(ProspectStatus::NoAnswer, now)
            .await?;
        report.no_answer_retries = self.retry_each(no_answers, now).await?;

        for candidate in self.db.list_due_prospects(ProspectStatus::Trial, now).await? {
            let _guard = self.lock(&candidate.phone).await;
            let prospect = match self.db.get_prospect(&candidate.phone).await? {
                Some(p) if p.status == ProspectStatus::Trial && p.is_due(now) => p,
                _ => continue,
            };
            if self.step(&candidate.phone, self.trial_checkpoint(prospect, now)).await {
                report.trial_messages.sent += 1;
            }
        }

        report.demo_sessions_purged = self.db.purge_expired_demo_sessions(now).await?;
        Ok(report)
    }
}

#[async_trait]
impl SessionObserver for NurtureEngine {
    async fn demo_connected(&self, prospect_phone: &str) {
        if let Err(e) = self.mark_demo_answered(prospect_phone).await {
            warn!(phone = prospect_phone, error = %e, "Could not mark demo answered");
        }
    }

    async fn demo_closed(&self, prospect_phone: &str) {
        match self.db.delete_demo_session(prospect_phone).await {
            Ok(_) => self.event(prospect_phone, "demo_session_closed", None).await,
            Err(e) => warn!(phone = prospect_phone, error = %e, "Failed to remove demo session"),
        }
    }
}

/// Spawn the background campaign ticker.
pub fn spawn_ticker(engine: Arc<NurtureEngine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match engine.tick(Utc::now()).await {
                Ok(report) => debug!(?report, "Nurture tick"),
                Err(e) => error!(error = %e, "Nurture tick failed"),
            }
        }
    })
}
