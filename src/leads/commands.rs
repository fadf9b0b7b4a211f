//! Keyword commands texted in by a tenant's operator.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::leads::model::{Lead, LeadStatus, Quote, Tenant, normalize_phone};
use crate::store::Database;
use crate::transport::Transport;

/// Number of leads listed by `LEADS`.
pub const LEADS_LIST_LIMIT: usize = 5;

/// How far back a loosely typed phone number is matched against leads.
const LOOKUP_WINDOW: usize = 200;

pub const HELP_TEXT: &str = "Commands:\nLEADS - recent leads\nAPPROVE <phone> <low> <high> - text the customer a quote\nDONE <phone> - mark a lead handled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Leads,
    Approve { phone: String, low: i64, high: i64 },
    Done { phone: String },
    Help,
}

impl OperatorCommand {
    /// Parse a command. Anything unrecognised or malformed is `Help`.
    pub fn parse(body: &str) -> Self {
        let parts: Vec<&str> = body.split_whitespace().collect();
        let Some(keyword) = parts.first() else {
            return Self::Help;
        };

        match keyword.to_uppercase().as_str() {
            "LEADS" if parts.len() == 1 => Self::Leads,
            "DONE" if parts.len() == 2 => Self::Done {
                phone: parts[1].to_string(),
            },
            "APPROVE" if parts.len() == 4 => {
                match (parse_amount(parts[2]), parse_amount(parts[3])) {
                    (Some(low), Some(high)) if low <= high => Self::Approve {
                        phone: parts[1].to_string(),
                        low,
                        high,
                    },
                    _ => Self::Help,
                }
            }
            _ => Self::Help,
        }
    }
}

fn parse_amount(s: &str) -> Option<i64> {
    s.trim_start_matches('$').replace(',', "").parse().ok()
}

pub struct CommandHandler {
    db: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
}

impl CommandHandler {
    pub fn new(db: Arc<dyn Database>, transport: Arc<dyn Transport>) -> Self {
        Self { db, transport }
    }

    /// Run a command for `tenant` and return the reply text.
    pub async fn handle(&self, tenant: &Tenant, body: &str) -> Result<String, DatabaseError> {
        let command = OperatorCommand::parse(body);
        info!(tenant = %tenant.id, command = ?command, "Operator command");

        match command {
            OperatorCommand::Leads => self.list_leads(tenant).await,
            OperatorCommand::Done { phone } => self.mark_done(tenant, &phone).await,
            OperatorCommand::Approve { phone, low, high } => {
                self.approve(tenant, &phone, low, high).await
            }
            OperatorCommand::Help => Ok(HELP_TEXT.to_string()),
        }
    }

    async fn list_leads(&self, tenant: &Tenant) -> Result<String, DatabaseError> {
        let leads = self.db.list_leads(&tenant.id, LEADS_LIST_LIMIT).await?;
        if leads.is_empty() {
            return Ok("No leads yet.".to_string());
        }

        let lines: Vec<String> = leads
            .iter()
            .enumerate()
            .map(|(i, lead)| {
                format!(
                    "{}. {}{} - {} ({}) [{}]",
                    i + 1,
                    if lead.urgent { "URGENT " } else { "" },
                    lead.name.as_deref().unwrap_or("Unknown"),
                    lead.problem.as_deref().unwrap_or("no details"),
                    lead.phone,
                    lead.status,
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }

    async fn mark_done(&self, tenant: &Tenant, phone: &str) -> Result<String, DatabaseError> {
        let Some(lead) = self.find_lead(tenant, phone).await? else {
            return Ok(format!("No lead found for {phone}."));
        };
        self.db
            .update_lead_status(&lead.phone, &tenant.id, LeadStatus::Done)
            .await?;
        Ok(format!(
            "Marked {} ({}) as done.",
            lead.name.as_deref().unwrap_or("lead"),
            lead.phone
        ))
    }

    async fn approve(
        &self,
        tenant: &Tenant,
        phone: &str,
        low: i64,
        high: i64,
    ) -> Result<String, DatabaseError> {
        let Some(lead) = self.find_lead(tenant, phone).await? else {
            return Ok(format!("No lead found for {phone}."));
        };

        let name = lead.name.as_deref().unwrap_or("there");
        let message = format!(
            "Hi {name}, {business} here.\nBased on what you've described, we estimate ${low}-${high}.\n{owner} will confirm the exact price on-site. Reply YES to confirm or call us to discuss.",
            business = tenant.business_name,
            owner = tenant.owner_name,
        );

        if let Err(e) = self
            .transport
            .send_message(&lead.phone, &tenant.transport_address, &message)
            .await
        {
            warn!(phone = %lead.phone, error = %e, "Quote send failed");
            return Ok(format!(
                "Couldn't send the quote to {}. Try again shortly.",
                lead.phone
            ));
        }

        self.db
            .insert_quote(&Quote {
                phone: lead.phone.clone(),
                tenant_id: tenant.id.clone(),
                problem: lead.problem.clone(),
                estimate_low: low,
                estimate_high: high,
                created_at: Utc::now(),
            })
            .await?;

        Ok(format!("Quote sent to {name} ({}): ${low}-${high}.", lead.phone))
    }

    /// Exact match first, then a digits-only match against recent leads.
    async fn find_lead(&self, tenant: &Tenant, phone: &str) -> Result<Option<Lead>, DatabaseError> {
        if let Some(lead) = self.db.get_lead(phone, &tenant.id).await? {
            return Ok(Some(lead));
        }

        let wanted = normalize_phone(phone);
        if wanted.is_empty() {
            return Ok(None);
        }
        let leads = self.db.list_leads(&tenant.id, LOOKUP_WINDOW).await?;
        Ok(leads.into_iter().find(|lead| {
            let have = normalize_phone(&lead.phone);
            !have.is_empty() && (have.ends_with(&wanted) || wanted.ends_with(&have))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::model::LeadChannel;
    use crate::store::LibSqlBackend;
    use crate::testing::{self, RecordingTransport};

    #[test]
    fn parse_commands() {
        assert_eq!(OperatorCommand::parse("leads"), OperatorCommand::Leads);
        assert_eq!(
            OperatorCommand::parse("DONE +14165551234"),
            OperatorCommand::Done {
                phone: "+14165551234".into()
            }
        );
        assert_eq!(
            OperatorCommand::parse("approve 4165551234 $200 350"),
            OperatorCommand::Approve {
                phone: "4165551234".into(),
                low: 200,
                high: 350
            }
        );
        assert_eq!(OperatorCommand::parse("APPROVE 416 500 200"), OperatorCommand::Help);
        assert_eq!(OperatorCommand::parse("hello"), OperatorCommand::Help);
        assert_eq!(OperatorCommand::parse(""), OperatorCommand::Help);
    }

    async fn setup() -> (CommandHandler, Arc<dyn Database>, Arc<RecordingTransport>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let transport = RecordingTransport::new();
        let now = Utc::now();
        db.upsert_lead(&Lead {
            phone: "+14165551234".into(),
            tenant_id: "mikes".into(),
            name: Some("John Smith".into()),
            address: Some("45 George Street".into()),
            contact_phone: Some("0412345678".into()),
            problem: Some("burst pipe".into()),
            urgent: true,
            channel: LeadChannel::Voice,
            status: LeadStatus::New,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
        (
            CommandHandler::new(db.clone(), transport.clone()),
            db,
            transport,
        )
    }

    #[tokio::test]
    async fn leads_lists_recent() {
        let (handler, _, _) = setup().await;
        let reply = handler.handle(&testing::tenant(), "LEADS").await.unwrap();
        assert!(reply.starts_with("1. URGENT John Smith - burst pipe"));
    }

    #[tokio::test]
    async fn done_matches_loose_phone() {
        let (handler, db, _) = setup().await;
        let reply = handler
            .handle(&testing::tenant(), "DONE 416-555-1234")
            .await
            .unwrap();
        assert!(reply.contains("as done"));
        let lead = db.get_lead("+14165551234", "mikes").await.unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::Done);
    }

    #[tokio::test]
    async fn approve_texts_customer() {
        let (handler, _, transport) = setup().await;
        let reply = handler
            .handle(&testing::tenant(), "APPROVE +14165551234 200 350")
            .await
            .unwrap();
        assert!(reply.starts_with("Quote sent to John Smith"));

        let sent = transport.bodies_to("+14165551234");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("$200-$350"));
    }

    #[tokio::test]
    async fn unknown_phone() {
        let (handler, _, transport) = setup().await;
        let reply = handler
            .handle(&testing::tenant(), "APPROVE +19998887777 1 2")
            .await
            .unwrap();
        assert_eq!(reply, "No lead found for +19998887777.");
        assert!(transport.messages().is_empty());
    }
}
