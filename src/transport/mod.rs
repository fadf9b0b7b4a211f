//! Message and voice transport.
//!
//! The `Transport` trait is the seam between the receptionist and the
//! carrier: send a text, or originate a call attached to the relay.

pub mod twilio;
pub mod twiml;

pub use twilio::TwilioTransport;
pub use twiml::RelayDocument;

use async_trait::async_trait;

use crate::error::TransportError;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a text message. Returns the carrier's message id.
    async fn send_message(&self, to: &str, from: &str, body: &str) -> Result<String, TransportError>;

    /// Call `to` and connect the answered call to the relay described by
    /// `relay`. Returns the carrier's call id.
    async fn originate_call(
        &self,
        to: &str,
        from: &str,
        relay: &RelayDocument,
    ) -> Result<String, TransportError>;
}
