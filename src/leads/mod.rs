//! Inbound leads: data model, extraction, operator alerts and commands.

pub mod commands;
pub mod extractor;
pub mod model;
pub mod notify;

pub use commands::{CommandHandler, OperatorCommand};
pub use extractor::{LeadExtraction, LeadExtractor};
pub use model::{Lead, LeadChannel, LeadStatus, SessionKey, Tenant, Turn};
pub use notify::{LeadAlert, NotificationDispatcher, spawn_notification_sweep};
