//! Outbound campaign: prospects, message copy and the nurture engine.

pub mod engine;
pub mod model;
pub mod templates;

pub use engine::{BatchResult, NurtureEngine, ReplyOutcome, TickReport, spawn_ticker};
pub use model::{DemoSession, OutboundEvent, Prospect, ProspectStatus};
pub use templates::Templates;
