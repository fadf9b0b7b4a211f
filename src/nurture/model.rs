//! Prospect state machine and outbound campaign records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Funnel state of a prospect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProspectStatus {
    /// Registered, never contacted.
    Pending,
    /// Initial message sent; follow-ups may be due.
    Contacted,
    /// Replied affirmatively; demo call about to be placed.
    Responded,
    /// Demo call originated, outcome unknown.
    DemoCalled,
    /// Prospect picked up the demo call.
    DemoAnswered,
    /// Demo call went unanswered.
    NoAnswer,
    /// Trial offer sent after the demo.
    DemoDone,
    /// Trial activated.
    Trial,
    /// Paying customer.
    Paid,
    /// Gave up on this prospect.
    Dead,
}

impl ProspectStatus {
    pub const ALL: [ProspectStatus; 10] = [
        Self::Pending,
        Self::Contacted,
        Self::Responded,
        Self::DemoCalled,
        Self::DemoAnswered,
        Self::NoAnswer,
        Self::DemoDone,
        Self::Trial,
        Self::Paid,
        Self::Dead,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ProspectStatus) -> bool {
        use ProspectStatus::*;

        matches!(
            (self, target),
            (Pending, Contacted) |
            // Follow-ups stay in Contacted until the limit forces Dead
            (Contacted, Contacted) | (Contacted, Dead) |
            // Affirmative replies re-open the demo path
            (Pending, Responded) | (Contacted, Responded) | (NoAnswer, Responded) |
            (DemoDone, Responded) | (Dead, Responded) |
            (Responded, DemoCalled) | (Responded, DemoAnswered) | (Responded, NoAnswer) |
            (DemoCalled, DemoAnswered) | (DemoCalled, NoAnswer) |
            (NoAnswer, NoAnswer) |
            (DemoAnswered, DemoDone) |
            (DemoDone, Trial) |
            (Trial, Trial) | (Trial, Paid) | (Trial, Dead) |
            (Dead, Paid)
        )
    }

    /// A demo call is in flight; replies and ticks must not restart it.
    pub fn is_demo_in_flight(&self) -> bool {
        matches!(self, Self::Responded | Self::DemoCalled | Self::DemoAnswered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Contacted => "contacted",
            Self::Responded => "responded",
            Self::DemoCalled => "demo_called",
            Self::DemoAnswered => "demo_answered",
            Self::NoAnswer => "no_answer",
            Self::DemoDone => "demo_done",
            Self::Trial => "trial",
            Self::Paid => "paid",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for ProspectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProspectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown prospect status: {s}"))
    }
}

/// An outbound-campaign target business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prospect {
    pub phone: String,
    pub business_name: String,
    pub owner_name: Option<String>,
    pub city: Option<String>,
    pub status: ProspectStatus,
    pub sms_sent: bool,
    pub responded: bool,
    pub demo_called: bool,
    pub demo_answered: bool,
    pub trial_activated: bool,
    pub follow_up_count: u32,
    pub next_follow_up_at: Option<DateTime<Utc>>,
    pub last_follow_up_at: Option<DateTime<Utc>>,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prospect {
    pub fn new(phone: impl Into<String>, business_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            phone: phone.into(),
            business_name: business_name.into(),
            owner_name: None,
            city: None,
            status: ProspectStatus::Pending,
            sms_sent: false,
            responded: false,
            demo_called: false,
            demo_answered: false,
            trial_activated: false,
            follow_up_count: 0,
            next_follow_up_at: None,
            last_follow_up_at: None,
            trial_started_at: None,
            trial_reminder_sent: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_owner(mut self, owner_name: impl Into<String>) -> Self {
        self.owner_name = Some(owner_name.into());
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    /// Owner name for message salutations.
    pub fn salutation(&self) -> &str {
        match self.owner_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => "there",
        }
    }

    /// Is the scheduled step due at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_follow_up_at.is_some_and(|at| at <= now)
    }
}

/// Mapping that lets a demo call impersonate the prospect's own business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoSession {
    pub prospect_phone: String,
    pub business_name: String,
    pub owner_name: String,
    pub expires_at: DateTime<Utc>,
}

/// One entry in a prospect's campaign history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub phone: String,
    pub event: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What a prospect's inbound text means to the campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyIntent {
    /// Opt-in to a demo call.
    Affirmative,
    /// Activate a free trial.
    Trial,
    Other,
}

/// Classify a reply by exact, case-folded keyword match.
///
/// Surrounding whitespace and trailing `.`/`!` are ignored; nothing else is
/// interpreted.
pub fn classify_reply(body: &str, affirmative: &[String], trial: &[String]) -> ReplyIntent {
    let normalized = body
        .trim()
        .trim_end_matches(['.', '!'])
        .trim()
        .to_uppercase();

    if affirmative.iter().any(|k| k.to_uppercase() == normalized) {
        ReplyIntent::Affirmative
    } else if trial.iter().any(|k| k.to_uppercase() == normalized) {
        ReplyIntent::Trial
    } else {
        ReplyIntent::Other
    }
}
