//! Tradie Desk: an automated receptionist for trades businesses, plus the
//! outbound campaign that sells it.

pub mod config;
pub mod error;
pub mod leads;
pub mod llm;
pub mod nurture;
pub mod prompts;
pub mod routes;
pub mod session;
pub mod sms;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;
