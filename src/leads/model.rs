//! Inbound customer data: conversation turns, leads, tenants, quotes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who spoke a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Customer,
    Agent,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Agent => "agent",
        }
    }
}

impl FromStr for Speaker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown speaker: {other}")),
        }
    }
}

/// One persisted utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn customer(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Customer,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Agent,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The channel a lead came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadChannel {
    Voice,
    Sms,
}

impl fmt::Display for LeadChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Voice => "voice",
            Self::Sms => "sms",
        })
    }
}

impl FromStr for LeadChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" => Ok(Self::Voice),
            "sms" => Ok(Self::Sms),
            other => Err(format!("unknown lead channel: {other}")),
        }
    }
}

/// Operator-facing lead status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Done,
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Done => "done",
        })
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown lead status: {other}")),
        }
    }
}

/// The structured outcome of a session, one row per (phone, tenant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub phone: String,
    pub tenant_id: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub contact_phone: Option<String>,
    pub problem: Option<String>,
    pub urgent: bool,
    pub channel: LeadChannel,
    pub status: LeadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A business account served by the receptionist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub business_name: String,
    pub owner_name: String,
    pub owner_phone: String,
    /// Inbound number the tenant's customers call or text.
    pub transport_address: String,
    pub region: String,
    pub active: bool,
}

impl Tenant {
    /// Is `sender` this tenant's operator? Compares digits only.
    pub fn is_operator(&self, sender: &str) -> bool {
        let owner = normalize_phone(&self.owner_phone);
        !owner.is_empty() && owner == normalize_phone(sender)
    }
}

/// A price estimate sent to a customer on the operator's approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub phone: String,
    pub tenant_id: String,
    pub problem: Option<String>,
    pub estimate_low: i64,
    pub estimate_high: i64,
    pub created_at: DateTime<Utc>,
}

/// Identifies one finalized session for the notification guard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub subject_phone: String,
    pub tenant_address: String,
    /// Call id, or another per-session discriminator.
    pub session_id: String,
}

impl SessionKey {
    pub fn new(
        subject_phone: impl Into<String>,
        tenant_address: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            subject_phone: subject_phone.into(),
            tenant_address: tenant_address.into(),
            session_id: session_id.into(),
        }
    }
}

/// A persisted operator alert awaiting (re)delivery.
#[derive(Debug, Clone)]
pub struct PendingAlert {
    pub key: SessionKey,
    pub operator_phone: String,
    pub from_address: String,
    pub body: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Strip everything but digits from a phone number.
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}
