//! Twilio REST client for outbound messages and calls.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::TwilioConfig;
use crate::error::TransportError;
use crate::transport::Transport;
use crate::transport::twiml::RelayDocument;

/// Subset of Twilio's resource response we care about.
#[derive(Debug, Deserialize)]
struct ResourceResponse {
    sid: Option<String>,
    message: Option<String>,
}

pub struct TwilioTransport {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl TwilioTransport {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, resource: &str) -> String {
        format!(
            "{}/Accounts/{}/{resource}.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    /// POST a form to a Twilio resource and return the created sid.
    async fn create(&self, resource: &str, form: &[(&str, &str)]) -> Result<String, String> {
        let resp = self
            .client
            .post(self.api_url(resource))
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        let body: ResourceResponse = resp
            .json()
            .await
            .map_err(|e| format!("unreadable response ({status}): {e}"))?;

        if !status.is_success() {
            let reason = body.message.unwrap_or_else(|| status.to_string());
            warn!(resource, %status, reason = %reason, "Twilio API error");
            return Err(reason);
        }

        body.sid.ok_or_else(|| "response missing sid".to_string())
    }
}

#[async_trait]
impl Transport for TwilioTransport {
    async fn send_message(&self, to: &str, from: &str, body: &str) -> Result<String, TransportError> {
        let sid = self
            .create("Messages", &[("To", to), ("From", from), ("Body", body)])
            .await
            .map_err(|reason| TransportError::SendFailed {
                to: to.to_string(),
                reason,
            })?;
        debug!(to, sid = %sid, "Message sent");
        Ok(sid)
    }

    async fn originate_call(
        &self,
        to: &str,
        from: &str,
        relay: &RelayDocument,
    ) -> Result<String, TransportError> {
        let twiml = relay.render();
        let sid = self
            .create("Calls", &[("To", to), ("From", from), ("Twiml", twiml.as_str())])
            .await
            .map_err(|reason| TransportError::CallFailed {
                to: to.to_string(),
                reason,
            })?;
        debug!(to, sid = %sid, relay = %relay.url, "Call originated");
        Ok(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_base: &str) -> TwilioConfig {
        TwilioConfig {
            account_sid: "AC123".to_string(),
            auth_token: secrecy::SecretString::from("token"),
            from_number: "+15550001111".to_string(),
            api_base: api_base.to_string(),
        }
    }

    #[test]
    fn api_url_includes_account() {
        let transport = TwilioTransport::new(config("https://api.twilio.com/2010-04-01/"));
        assert_eq!(
            transport.api_url("Messages"),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[tokio::test]
    async fn unreachable_api_is_a_send_failure() {
        // Port 9 (discard) on localhost refuses connections.
        let transport = TwilioTransport::new(config("http://127.0.0.1:9"));
        let err = transport
            .send_message("+15551234567", "+15550001111", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::SendFailed { ref to, .. } if to == "+15551234567"));
    }
}
