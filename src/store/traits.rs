//! Unified `Database` trait, a single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::leads::model::{Lead, LeadStatus, PendingAlert, Quote, SessionKey, Tenant, Turn};
use crate::nurture::model::{DemoSession, OutboundEvent, Prospect, ProspectStatus};

/// Backend-agnostic database trait covering conversations, leads, and the
/// outbound campaign.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Append one turn to the (phone, tenant) conversation.
    async fn append_turn(
        &self,
        phone: &str,
        tenant_id: &str,
        turn: &Turn,
    ) -> Result<(), DatabaseError>;

    /// All turns for the (phone, tenant) conversation, oldest first.
    async fn get_conversation(
        &self,
        phone: &str,
        tenant_id: &str,
    ) -> Result<Vec<Turn>, DatabaseError>;

    /// Delete a conversation. Returns the number of turns removed.
    async fn clear_conversation(&self, phone: &str, tenant_id: &str)
    -> Result<usize, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert or overwrite the lead for (phone, tenant). Status resets to `new`.
    async fn upsert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, phone: &str, tenant_id: &str) -> Result<Option<Lead>, DatabaseError>;

    /// Most recently updated leads for a tenant.
    async fn list_leads(&self, tenant_id: &str, limit: usize) -> Result<Vec<Lead>, DatabaseError>;

    /// Returns false when no such lead exists.
    async fn update_lead_status(
        &self,
        phone: &str,
        tenant_id: &str,
        status: LeadStatus,
    ) -> Result<bool, DatabaseError>;

    // ── Tenants ─────────────────────────────────────────────────────

    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), DatabaseError>;

    /// Look up an active tenant by its inbound number.
    async fn get_tenant_by_address(&self, address: &str) -> Result<Option<Tenant>, DatabaseError>;

    // ── Quotes ──────────────────────────────────────────────────────

    /// Record a sent quote. Returns the generated id.
    async fn insert_quote(&self, quote: &Quote) -> Result<String, DatabaseError>;

    // ── Session completions ─────────────────────────────────────────

    /// Atomically claim a session for finalize. Only the first caller for a
    /// given key gets `true`. The claimed row carries `body` as its alert
    /// from the start, so the sweep can deliver it if finalize never does.
    async fn claim_session(
        &self,
        key: &SessionKey,
        operator_phone: &str,
        from_address: &str,
        body: &str,
    ) -> Result<bool, DatabaseError>;

    /// Replace the alert on a claimed row before sending it.
    async fn record_pending_alert(
        &self,
        key: &SessionKey,
        operator_phone: &str,
        from_address: &str,
        body: &str,
    ) -> Result<(), DatabaseError>;

    async fn mark_session_notified(&self, key: &SessionKey) -> Result<(), DatabaseError>;

    /// Count a failed delivery. Returns the new attempt count.
    async fn record_alert_failure(&self, key: &SessionKey) -> Result<u32, DatabaseError>;

    /// Un-notified alerts created before `older_than` with fewer than
    /// `max_attempts` failed deliveries.
    async fn list_pending_alerts(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<PendingAlert>, DatabaseError>;

    async fn is_session_notified(&self, key: &SessionKey) -> Result<bool, DatabaseError>;

    // ── Prospects ───────────────────────────────────────────────────

    /// Insert a new prospect. Returns false if the phone is already known.
    async fn insert_prospect(&self, prospect: &Prospect) -> Result<bool, DatabaseError>;

    async fn get_prospect(&self, phone: &str) -> Result<Option<Prospect>, DatabaseError>;

    async fn list_prospects(&self) -> Result<Vec<Prospect>, DatabaseError>;

    /// Prospects in `status`, oldest first.
    async fn list_prospects_by_status(
        &self,
        status: ProspectStatus,
        limit: usize,
    ) -> Result<Vec<Prospect>, DatabaseError>;

    /// Prospects in `status` whose `next_follow_up_at` is at or before `now`.
    async fn list_due_prospects(
        &self,
        status: ProspectStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<Prospect>, DatabaseError>;

    /// Write `prospect` only if the stored status is still `expected`.
    /// Returns false when another writer got there first.
    async fn update_prospect(
        &self,
        expected: ProspectStatus,
        prospect: &Prospect,
    ) -> Result<bool, DatabaseError>;

    async fn log_outbound_event(
        &self,
        phone: &str,
        event: &str,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Campaign history for one prospect, oldest first.
    async fn list_outbound_events(&self, phone: &str) -> Result<Vec<OutboundEvent>, DatabaseError>;

    // ── Demo sessions ───────────────────────────────────────────────

    async fn upsert_demo_session(&self, session: &DemoSession) -> Result<(), DatabaseError>;

    /// The demo session for `phone`, unless it expired before `now`.
    async fn get_demo_session(
        &self,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DemoSession>, DatabaseError>;

    async fn delete_demo_session(&self, phone: &str) -> Result<bool, DatabaseError>;

    /// Remove expired demo sessions. Returns the number removed.
    async fn purge_expired_demo_sessions(&self, now: DateTime<Utc>)
    -> Result<usize, DatabaseError>;
}
