//! Operator notifications, at most once per finalized session.
//!
//! A session is claimed in the `session_completions` table together with a
//! provisional alert, so a claimed row always has something for the sweep
//! to send even if finalize dies before its own delivery. The final alert
//! replaces the provisional one just before sending.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::DatabaseError;
use crate::leads::model::{LeadChannel, SessionKey};
use crate::store::Database;
use crate::transport::Transport;

/// The sweep stops retrying an alert after this many failed deliveries.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Placeholder name for a caller who never gave one.
pub const UNKNOWN_CALLER: &str = "Unknown caller";

/// Placeholder problem for a session that ended before details were taken.
pub const INCOMPLETE_PROBLEM: &str = "Called — details incomplete";

/// Fields rendered into an operator alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadAlert {
    pub urgent: bool,
    pub partial: bool,
    pub channel: LeadChannel,
    pub name: String,
    pub address: Option<String>,
    pub contact_phone: String,
    pub problem: String,
}

impl LeadAlert {
    /// Render the SMS body sent to the operator.
    pub fn render(&self) -> String {
        let header = match (self.urgent, self.partial) {
            (true, _) => "URGENT LEAD",
            (false, true) => "MISSED CALL (details incomplete)",
            (false, false) => "NEW LEAD",
        };
        let mut body = format!(
            "{header} via {}\nProblem: {}\nName: {}\n",
            self.channel, self.problem, self.name
        );
        if let Some(address) = self.address.as_deref().filter(|a| !a.is_empty()) {
            body.push_str(&format!("Address: {address}\n"));
        }
        body.push_str(&format!("Phone: {}\n\n", self.contact_phone));
        body.push_str(&format!(
            "Reply APPROVE {phone} <low> <high> to send a quote, DONE {phone} when handled, or LEADS to list recent leads.",
            phone = self.contact_phone
        ));
        body
    }
}

/// Outcome of a sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub resent: usize,
    pub failed: usize,
}

pub struct NotificationDispatcher {
    db: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
}

impl NotificationDispatcher {
    pub fn new(db: Arc<dyn Database>, transport: Arc<dyn Transport>) -> Self {
        Self { db, transport }
    }

    /// Claim a session, storing `provisional` as its alert. Only the first
    /// claim for a key returns true.
    pub async fn claim(
        &self,
        key: &SessionKey,
        operator_phone: &str,
        from_address: &str,
        provisional: &LeadAlert,
    ) -> Result<bool, DatabaseError> {
        self.db
            .claim_session(key, operator_phone, from_address, &provisional.render())
            .await
    }

    /// Send the alert for a claimed session. Returns whether it went out.
    ///
    /// The alert is persisted before sending; on failure the session stays
    /// un-notified for the sweep. If the alert cannot be stored it is still
    /// sent, and the sweep falls back to the provisional alert.
    pub async fn deliver(
        &self,
        key: &SessionKey,
        operator_phone: &str,
        from_address: &str,
        alert: &LeadAlert,
    ) -> Result<bool, DatabaseError> {
        let body = alert.render();
        if let Err(e) = self
            .db
            .record_pending_alert(key, operator_phone, from_address, &body)
            .await
        {
            error!(session = %key.session_id, error = %e, "Failed to store alert; sending anyway");
        }
        self.send(key, operator_phone, from_address, &body).await
    }

    async fn send(
        &self,
        key: &SessionKey,
        operator_phone: &str,
        from_address: &str,
        body: &str,
    ) -> Result<bool, DatabaseError> {
        if operator_phone.trim().is_empty() {
            warn!(session = %key.session_id, "No operator phone configured; alert left pending");
            self.db.record_alert_failure(key).await?;
            return Ok(false);
        }

        match self
            .transport
            .send_message(operator_phone, from_address, body)
            .await
        {
            Ok(sid) => {
                self.db.mark_session_notified(key).await?;
                info!(
                    subject = %key.subject_phone,
                    session = %key.session_id,
                    sid = %sid,
                    "Operator notified"
                );
                Ok(true)
            }
            Err(e) => {
                let attempts = self.db.record_alert_failure(key).await?;
                warn!(
                    subject = %key.subject_phone,
                    session = %key.session_id,
                    attempts,
                    error = %e,
                    "Operator notification failed"
                );
                Ok(false)
            }
        }
    }

    /// Re-send alerts that have stayed pending longer than `grace`.
    pub async fn sweep(&self, grace: chrono::Duration) -> Result<SweepStats, DatabaseError> {
        let cutoff = Utc::now() - grace;
        let pending = self
            .db
            .list_pending_alerts(cutoff, MAX_DELIVERY_ATTEMPTS)
            .await?;

        let mut stats = SweepStats::default();
        for alert in pending {
            if self
                .send(&alert.key, &alert.operator_phone, &alert.from_address, &alert.body)
                .await?
            {
                stats.resent += 1;
            } else {
                stats.failed += 1;
                if alert.attempts + 1 >= MAX_DELIVERY_ATTEMPTS {
                    error!(
                        subject = %alert.key.subject_phone,
                        session = %alert.key.session_id,
                        "Giving up on operator notification"
                    );
                }
            }
        }
        Ok(stats)
    }
}

/// Spawn the background task that retries pending operator alerts.
pub fn spawn_notification_sweep(
    dispatcher: Arc<NotificationDispatcher>,
    interval: Duration,
    grace: chrono::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match dispatcher.sweep(grace).await {
                Ok(stats) if stats.resent + stats.failed > 0 => {
                    info!(resent = stats.resent, failed = stats.failed, "Notification sweep");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Notification sweep failed"),
            }
        }
    })
}
