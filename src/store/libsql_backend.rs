//! libSQL backend for the async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 (millisecond precision, `Z` suffix) so that string
//! comparison in SQL orders them chronologically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::leads::model::{
    Lead, LeadChannel, LeadStatus, PendingAlert, Quote, SessionKey, Speaker, Tenant, Turn,
};
use crate::nurture::model::{DemoSession, OutboundEvent, Prospect, ProspectStatus};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a raw statement, for tests that need to break the schema.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("execute_raw: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output, with or without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().filter(|s| !s.is_empty()).map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(&dt)),
        None => libsql::Value::Null,
    }
}

fn flag(row: &libsql::Row, idx: i32) -> bool {
    row.get::<i64>(idx).unwrap_or(0) != 0
}

// ── Row mapping ─────────────────────────────────────────────────────

const LEAD_COLUMNS: &str = "phone, tenant_id, name, address, contact_phone, problem, urgent, channel, status, created_at, updated_at";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let phone: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("lead.phone: {e}")))?;
    let tenant_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("lead.tenant_id: {e}")))?;

    let channel_str: String = row.get(7).unwrap_or_else(|_| "voice".to_string());
    let status_str: String = row.get(8).unwrap_or_else(|_| "new".to_string());
    let created_str: String = row.get(9).unwrap_or_default();
    let updated_str: String = row.get(10).unwrap_or_default();

    Ok(Lead {
        phone,
        tenant_id,
        name: row.get(2).ok(),
        address: row.get(3).ok(),
        contact_phone: row.get(4).ok(),
        problem: row.get(5).ok(),
        urgent: flag(row, 6),
        channel: channel_str.parse().unwrap_or(LeadChannel::Voice),
        status: status_str.parse().unwrap_or(LeadStatus::New),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const TENANT_COLUMNS: &str =
    "id, business_name, owner_name, owner_phone, transport_address, region, active";

fn row_to_tenant(row: &libsql::Row) -> Result<Tenant, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("tenant.id: {e}")))?;
    Ok(Tenant {
        id,
        business_name: row.get(1).unwrap_or_default(),
        owner_name: row.get(2).unwrap_or_default(),
        owner_phone: row.get(3).unwrap_or_default(),
        transport_address: row.get(4).unwrap_or_default(),
        region: row.get(5).unwrap_or_default(),
        active: flag(row, 6),
    })
}

const PROSPECT_COLUMNS: &str = "phone, business_name, owner_name, city, status, sms_sent, responded, demo_called, demo_answered, trial_activated, follow_up_count, next_follow_up_at, last_follow_up_at, trial_started_at, trial_reminder_sent, created_at, updated_at";

fn row_to_prospect(row: &libsql::Row) -> Result<Prospect, DatabaseError> {
    let phone: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("prospect.phone: {e}")))?;
    let business_name: String = row.get(1).unwrap_or_default();

    let status_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("prospect.status: {e}")))?;
    let status: ProspectStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;

    let follow_up_count: i64 = row.get(10).unwrap_or(0);
    let next_str: Option<String> = row.get(11).ok();
    let last_str: Option<String> = row.get(12).ok();
    let trial_str: Option<String> = row.get(13).ok();
    let created_str: String = row.get(15).unwrap_or_default();
    let updated_str: String = row.get(16).unwrap_or_default();

    Ok(Prospect {
        phone,
        business_name,
        owner_name: row.get(2).ok(),
        city: row.get(3).ok(),
        status,
        sms_sent: flag(row, 5),
        responded: flag(row, 6),
        demo_called: flag(row, 7),
        demo_answered: flag(row, 8),
        trial_activated: flag(row, 9),
        follow_up_count: u32::try_from(follow_up_count).unwrap_or(0),
        next_follow_up_at: parse_optional_datetime(&next_str),
        last_follow_up_at: parse_optional_datetime(&last_str),
        trial_started_at: parse_optional_datetime(&trial_str),
        trial_reminder_sent: flag(row, 14),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_prospects(mut rows: libsql::Rows) -> Result<Vec<Prospect>, DatabaseError> {
    let mut prospects = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        prospects.push(row_to_prospect(&row)?);
    }
    Ok(prospects)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn append_turn(
        &self,
        phone: &str,
        tenant_id: &str,
        turn: &Turn,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO conversation_turns (phone, tenant_id, speaker, text, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    phone,
                    tenant_id,
                    turn.speaker.as_str(),
                    turn.text.as_str(),
                    ts(&turn.timestamp)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_turn: {e}")))?;
        Ok(())
    }

    async fn get_conversation(
        &self,
        phone: &str,
        tenant_id: &str,
    ) -> Result<Vec<Turn>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT speaker, text, created_at FROM conversation_turns WHERE phone = ?1 AND tenant_id = ?2 ORDER BY seq ASC",
                params![phone, tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        let mut turns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let speaker_str: String = row.get(0).unwrap_or_default();
            let speaker: Speaker = speaker_str
                .parse()
                .map_err(|e: String| DatabaseError::Serialization(e))?;
            let created_str: String = row.get(2).unwrap_or_default();
            turns.push(Turn {
                speaker,
                text: row.get(1).unwrap_or_default(),
                timestamp: parse_datetime(&created_str),
            });
        }
        Ok(turns)
    }

    async fn clear_conversation(
        &self,
        phone: &str,
        tenant_id: &str,
    ) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM conversation_turns WHERE phone = ?1 AND tenant_id = ?2",
                params![phone, tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_conversation: {e}")))?;
        debug!(phone, tenant_id, removed = count, "Conversation cleared");
        Ok(count as usize)
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn upsert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO leads (phone, tenant_id, name, address, contact_phone, problem, urgent, channel, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'new', ?9, ?10)
                 ON CONFLICT(phone, tenant_id) DO UPDATE SET
                    name = excluded.name,
                    address = excluded.address,
                    contact_phone = excluded.contact_phone,
                    problem = excluded.problem,
                    urgent = excluded.urgent,
                    channel = excluded.channel,
                    status = 'new',
                    updated_at = excluded.updated_at",
                params![
                    lead.phone.as_str(),
                    lead.tenant_id.as_str(),
                    opt_text(lead.name.as_deref()),
                    opt_text(lead.address.as_deref()),
                    opt_text(lead.contact_phone.as_deref()),
                    opt_text(lead.problem.as_deref()),
                    i64::from(lead.urgent),
                    lead.channel.to_string(),
                    ts(&lead.created_at),
                    ts(&lead.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_lead: {e}")))?;

        debug!(phone = %lead.phone, tenant = %lead.tenant_id, urgent = lead.urgent, "Lead upserted");
        Ok(())
    }

    async fn get_lead(&self, phone: &str, tenant_id: &str) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE phone = ?1 AND tenant_id = ?2"),
                params![phone, tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn list_leads(&self, tenant_id: &str, limit: usize) -> Result<Vec<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ?1 ORDER BY updated_at DESC LIMIT ?2"
                ),
                params![tenant_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_leads: {e}")))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            leads.push(row_to_lead(&row)?);
        }
        Ok(leads)
    }

    async fn update_lead_status(
        &self,
        phone: &str,
        tenant_id: &str,
        status: LeadStatus,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE leads SET status = ?1, updated_at = ?2 WHERE phone = ?3 AND tenant_id = ?4",
                params![status.to_string(), ts(&Utc::now()), phone, tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_lead_status: {e}")))?;
        Ok(count > 0)
    }

    // ── Tenants ─────────────────────────────────────────────────────

    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenants (id, business_name, owner_name, owner_phone, transport_address, region, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    business_name = excluded.business_name,
                    owner_name = excluded.owner_name,
                    owner_phone = excluded.owner_phone,
                    transport_address = excluded.transport_address,
                    region = excluded.region,
                    active = excluded.active",
                params![
                    tenant.id.as_str(),
                    tenant.business_name.as_str(),
                    tenant.owner_name.as_str(),
                    tenant.owner_phone.as_str(),
                    tenant.transport_address.as_str(),
                    tenant.region.as_str(),
                    i64::from(tenant.active),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_tenant: {e}")))?;
        Ok(())
    }

    async fn get_tenant_by_address(&self, address: &str) -> Result<Option<Tenant>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TENANT_COLUMNS} FROM tenants WHERE transport_address = ?1 AND active = 1"
                ),
                params![address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_tenant_by_address: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_tenant(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_tenant_by_address: {e}"))),
        }
    }

    // ── Quotes ──────────────────────────────────────────────────────

    async fn insert_quote(&self, quote: &Quote) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO quotes (id, phone, tenant_id, problem, estimate_low, estimate_high, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'sent', ?7)",
                params![
                    id.as_str(),
                    quote.phone.as_str(),
                    quote.tenant_id.as_str(),
                    opt_text(quote.problem.as_deref()),
                    quote.estimate_low,
                    quote.estimate_high,
                    ts(&quote.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_quote: {e}")))?;
        Ok(id)
    }

    // ── Session completions ─────────────────────────────────────────

    async fn claim_session(
        &self,
        key: &SessionKey,
        operator_phone: &str,
        from_address: &str,
        body: &str,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "INSERT INTO session_completions
                    (subject_phone, tenant_address, session_id, operator_phone, from_address, alert_body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(subject_phone, tenant_address, session_id) DO NOTHING",
                params![
                    key.subject_phone.as_str(),
                    key.tenant_address.as_str(),
                    key.session_id.as_str(),
                    operator_phone,
                    from_address,
                    body,
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_session: {e}")))?;
        Ok(count == 1)
    }

    async fn record_pending_alert(
        &self,
        key: &SessionKey,
        operator_phone: &str,
        from_address: &str,
        body: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE session_completions SET operator_phone = ?1, from_address = ?2, alert_body = ?3
                 WHERE subject_phone = ?4 AND tenant_address = ?5 AND session_id = ?6",
                params![
                    operator_phone,
                    from_address,
                    body,
                    key.subject_phone.as_str(),
                    key.tenant_address.as_str(),
                    key.session_id.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_pending_alert: {e}")))?;
        Ok(())
    }

    async fn mark_session_notified(&self, key: &SessionKey) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE session_completions SET notified = 1, notified_at = ?1
                 WHERE subject_phone = ?2 AND tenant_address = ?3 AND session_id = ?4",
                params![
                    ts(&Utc::now()),
                    key.subject_phone.as_str(),
                    key.tenant_address.as_str(),
                    key.session_id.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_session_notified: {e}")))?;
        Ok(())
    }

    async fn record_alert_failure(&self, key: &SessionKey) -> Result<u32, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE session_completions SET attempts = attempts + 1
                 WHERE subject_phone = ?1 AND tenant_address = ?2 AND session_id = ?3",
                params![
                    key.subject_phone.as_str(),
                    key.tenant_address.as_str(),
                    key.session_id.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_alert_failure: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "SELECT attempts FROM session_completions
                 WHERE subject_phone = ?1 AND tenant_address = ?2 AND session_id = ?3",
                params![
                    key.subject_phone.as_str(),
                    key.tenant_address.as_str(),
                    key.session_id.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_alert_failure: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let attempts: i64 = row.get(0).unwrap_or(0);
                Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
            }
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "session_completion".to_string(),
                id: key.session_id.clone(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("record_alert_failure: {e}"))),
        }
    }

    async fn list_pending_alerts(
        &self,
        older_than: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<PendingAlert>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT subject_phone, tenant_address, session_id, operator_phone, from_address, alert_body, attempts, created_at
                 FROM session_completions
                 WHERE notified = 0 AND alert_body IS NOT NULL AND created_at <= ?1 AND attempts < ?2
                 ORDER BY created_at ASC",
                params![ts(&older_than), i64::from(max_attempts)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending_alerts: {e}")))?;

        let mut alerts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let attempts: i64 = row.get(6).unwrap_or(0);
            let created_str: String = row.get(7).unwrap_or_default();
            alerts.push(PendingAlert {
                key: SessionKey::new(
                    row.get::<String>(0).unwrap_or_default(),
                    row.get::<String>(1).unwrap_or_default(),
                    row.get::<String>(2).unwrap_or_default(),
                ),
                operator_phone: row.get(3).unwrap_or_default(),
                from_address: row.get(4).unwrap_or_default(),
                body: row.get(5).unwrap_or_default(),
                attempts: u32::try_from(attempts).unwrap_or(0),
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(alerts)
    }

    async fn is_session_notified(&self, key: &SessionKey) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT notified FROM session_completions
                 WHERE subject_phone = ?1 AND tenant_address = ?2 AND session_id = ?3",
                params![
                    key.subject_phone.as_str(),
                    key.tenant_address.as_str(),
                    key.session_id.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_session_notified: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(flag(&row, 0)),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("is_session_notified: {e}"))),
        }
    }

    // ── Prospects ───────────────────────────────────────────────────

    async fn insert_prospect(&self, p: &Prospect) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO prospects ({PROSPECT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                     ON CONFLICT(phone) DO NOTHING"
                ),
                params![
                    p.phone.as_str(),
                    p.business_name.as_str(),
                    opt_text(p.owner_name.as_deref()),
                    opt_text(p.city.as_deref()),
                    p.status.as_str(),
                    i64::from(p.sms_sent),
                    i64::from(p.responded),
                    i64::from(p.demo_called),
                    i64::from(p.demo_answered),
                    i64::from(p.trial_activated),
                    i64::from(p.follow_up_count),
                    opt_ts(p.next_follow_up_at),
                    opt_ts(p.last_follow_up_at),
                    opt_ts(p.trial_started_at),
                    i64::from(p.trial_reminder_sent),
                    ts(&p.created_at),
                    ts(&p.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_prospect: {e}")))?;
        Ok(count == 1)
    }

    async fn get_prospect(&self, phone: &str) -> Result<Option<Prospect>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROSPECT_COLUMNS} FROM prospects WHERE phone = ?1"),
                params![phone],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_prospect: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_prospect(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_prospect: {e}"))),
        }
    }

    async fn list_prospects(&self) -> Result<Vec<Prospect>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {PROSPECT_COLUMNS} FROM prospects ORDER BY created_at DESC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_prospects: {e}")))?;
        collect_prospects(rows).await
    }

    async fn list_prospects_by_status(
        &self,
        status: ProspectStatus,
        limit: usize,
    ) -> Result<Vec<Prospect>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROSPECT_COLUMNS} FROM prospects WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_prospects_by_status: {e}")))?;
        collect_prospects(rows).await
    }

    async fn list_due_prospects(
        &self,
        status: ProspectStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<Prospect>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROSPECT_COLUMNS} FROM prospects
                     WHERE status = ?1 AND next_follow_up_at IS NOT NULL AND next_follow_up_at <= ?2
                     ORDER BY next_follow_up_at ASC"
                ),
                params![status.as_str(), ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_prospects: {e}")))?;
        collect_prospects(rows).await
    }

    async fn update_prospect(
        &self,
        expected: ProspectStatus,
        p: &Prospect,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE prospects SET
                    business_name = ?1, owner_name = ?2, city = ?3, status = ?4,
                    sms_sent = ?5, responded = ?6, demo_called = ?7, demo_answered = ?8,
                    trial_activated = ?9, follow_up_count = ?10, next_follow_up_at = ?11,
                    last_follow_up_at = ?12, trial_started_at = ?13, trial_reminder_sent = ?14,
                    updated_at = ?15
                 WHERE phone = ?16 AND status = ?17",
                params![
                    p.business_name.as_str(),
                    opt_text(p.owner_name.as_deref()),
                    opt_text(p.city.as_deref()),
                    p.status.as_str(),
                    i64::from(p.sms_sent),
                    i64::from(p.responded),
                    i64::from(p.demo_called),
                    i64::from(p.demo_answered),
                    i64::from(p.trial_activated),
                    i64::from(p.follow_up_count),
                    opt_ts(p.next_follow_up_at),
                    opt_ts(p.last_follow_up_at),
                    opt_ts(p.trial_started_at),
                    i64::from(p.trial_reminder_sent),
                    ts(&p.updated_at),
                    p.phone.as_str(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_prospect: {e}")))?;

        if count == 0 {
            debug!(phone = %p.phone, expected = %expected, "Prospect update lost race");
        }
        Ok(count > 0)
    }

    async fn log_outbound_event(
        &self,
        phone: &str,
        event: &str,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO outbound_events (id, phone, event, detail, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    phone,
                    event,
                    opt_text(detail),
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("log_outbound_event: {e}")))?;
        Ok(())
    }

    async fn list_outbound_events(&self, phone: &str) -> Result<Vec<OutboundEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT phone, event, detail, created_at FROM outbound_events WHERE phone = ?1 ORDER BY created_at ASC, rowid ASC",
                params![phone],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_outbound_events: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let created_str: String = row.get(3).unwrap_or_default();
            events.push(OutboundEvent {
                phone: row.get(0).unwrap_or_default(),
                event: row.get(1).unwrap_or_default(),
                detail: row.get(2).ok(),
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(events)
    }

    // ── Demo sessions ───────────────────────────────────────────────

    async fn upsert_demo_session(&self, session: &DemoSession) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO demo_sessions (prospect_phone, business_name, owner_name, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(prospect_phone) DO UPDATE SET
                    business_name = excluded.business_name,
                    owner_name = excluded.owner_name,
                    expires_at = excluded.expires_at",
                params![
                    session.prospect_phone.as_str(),
                    session.business_name.as_str(),
                    session.owner_name.as_str(),
                    ts(&session.expires_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_demo_session: {e}")))?;
        Ok(())
    }

    async fn get_demo_session(
        &self,
        phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DemoSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT prospect_phone, business_name, owner_name, expires_at FROM demo_sessions
                 WHERE prospect_phone = ?1 AND expires_at > ?2",
                params![phone, ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_demo_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let expires_str: String = row.get(3).unwrap_or_default();
                Ok(Some(DemoSession {
                    prospect_phone: row.get(0).unwrap_or_default(),
                    business_name: row.get(1).unwrap_or_default(),
                    owner_name: row.get(2).unwrap_or_default(),
                    expires_at: parse_datetime(&expires_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_demo_session: {e}"))),
        }
    }

    async fn delete_demo_session(&self, phone: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM demo_sessions WHERE prospect_phone = ?1",
                params![phone],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_demo_session: {e}")))?;
        Ok(count > 0)
    }

    async fn purge_expired_demo_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM demo_sessions WHERE expires_at <= ?1",
                params![ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired_demo_sessions: {e}")))?;
        Ok(count as usize)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
