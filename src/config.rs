//! Configuration types, built from environment variables.

use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::session::completion::CompletionPolicy;

/// Emergency keywords that make a lead urgent.
pub const DEFAULT_URGENT_KEYWORDS: &[&str] = &[
    "flooding",
    "flooded",
    "burst pipe",
    "no hot water",
    "gas leak",
    "gas smell",
    "smell gas",
    "sewage",
    "frozen pipe",
    "no heat",
    "carbon monoxide",
];

/// Vocabulary hints passed to the speech relay.
pub const DEFAULT_SPEECH_HINTS: &[&str] = &[
    "furnace",
    "boiler",
    "HVAC",
    "heat pump",
    "thermostat",
    "hot water tank",
    "no heat",
    "frozen pipes",
];

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub twilio: TwilioConfig,
    pub session: SessionConfig,
    pub nurture: NurtureConfig,
    pub urgency: UrgencyPolicy,
    pub tenant: TenantDefaults,
}

impl AppConfig {
    /// Build the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = ServerConfig::from_env();
        let nurture = NurtureConfig::from_env(&server.base_url);
        Ok(Self {
            llm: llm_from_env()?,
            twilio: TwilioConfig::from_env()?,
            session: SessionConfig::from_env(),
            nurture,
            urgency: UrgencyPolicy::from_env(),
            tenant: TenantDefaults::from_env(),
            server,
        })
    }
}

/// HTTP server and storage settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Public base URL (`https://…`) used to build relay endpoints.
    pub base_url: String,
    pub db_path: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("TRADIE_PORT", 8080),
            base_url: env_or("BASE_URL", "http://localhost:8080")
                .trim_end_matches('/')
                .to_string(),
            db_path: env_or("TRADIE_DB_PATH", "./data/tradie-desk.db"),
        }
    }
}

fn llm_from_env() -> Result<LlmConfig, ConfigError> {
    let backend: LlmBackend = env_or("TRADIE_LLM_BACKEND", "openai")
        .parse()
        .map_err(|message| ConfigError::InvalidValue {
            key: "TRADIE_LLM_BACKEND".to_string(),
            message,
        })?;

    let key_var = backend.api_key_var();
    let api_key =
        std::env::var(key_var).map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;

    Ok(LlmConfig {
        backend,
        api_key: SecretString::from(api_key),
        model: env_or("TRADIE_MODEL", backend.default_model()),
    })
}

/// Twilio REST credentials.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    /// Number outbound messages and calls are sent from.
    pub from_number: String,
    pub api_base: String,
}

impl TwilioConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let account_sid = std::env::var("TWILIO_ACCOUNT_SID")
            .map_err(|_| ConfigError::MissingEnvVar("TWILIO_ACCOUNT_SID".to_string()))?;
        let auth_token = std::env::var("TWILIO_AUTH_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TWILIO_AUTH_TOKEN".to_string()))?;

        Ok(Self {
            account_sid,
            auth_token: SecretString::from(auth_token),
            from_number: env_or("TWILIO_PHONE_NUMBER", ""),
            api_base: env_or("TWILIO_API_BASE", "https://api.twilio.com/2010-04-01"),
        })
    }
}

/// Real-time session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Max wait for the next relay event before the session is closed.
    pub idle_timeout: Duration,
    /// Max wait for the generation service (per request and per stream delta).
    pub generation_timeout: Duration,
    pub reply_max_tokens: u32,
    pub reply_temperature: f32,
    pub language: String,
    pub hints: Vec<String>,
    pub completion: CompletionPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(20),
            reply_max_tokens: 150,
            reply_temperature: 0.7,
            language: "en-US".to_string(),
            hints: DEFAULT_SPEECH_HINTS.iter().map(|s| s.to_string()).collect(),
            completion: CompletionPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            idle_timeout: Duration::from_secs(env_parse("TRADIE_IDLE_TIMEOUT_SECS", 30)),
            generation_timeout: Duration::from_secs(env_parse("TRADIE_LLM_TIMEOUT_SECS", 20)),
            language: env_or("TRADIE_LANGUAGE", &defaults.language),
            hints: env_list("TRADIE_SPEECH_HINTS").unwrap_or(defaults.hints),
            ..Self::default()
        }
    }
}

/// Outbound nurture timing and copy settings.
#[derive(Debug, Clone)]
pub struct NurtureConfig {
    pub tick_interval: Duration,
    pub follow_up_interval: chrono::Duration,
    pub max_follow_ups: u32,
    /// Pending prospects contacted per tick.
    pub batch_size: usize,
    /// Delay between the confirmation message and the demo call.
    pub demo_call_delay: Duration,
    /// How long after origination a demo call is considered resolved.
    pub post_call_wait: chrono::Duration,
    pub demo_session_ttl: chrono::Duration,
    /// Pause between consecutive sends in a batch.
    pub send_spacing: Duration,
    pub trial_reminder_after: chrono::Duration,
    pub trial_length: chrono::Duration,
    pub trial_link: String,
    pub payment_link: String,
    /// Relay endpoint for demo calls (`wss://…/demo-ws`).
    pub demo_relay_url: String,
    pub affirmative_keywords: Vec<String>,
    pub trial_keywords: Vec<String>,
}

impl Default for NurtureConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30 * 60),
            follow_up_interval: chrono::Duration::days(5),
            max_follow_ups: 2,
            batch_size: 20,
            demo_call_delay: Duration::from_secs(4),
            post_call_wait: chrono::Duration::minutes(3),
            demo_session_ttl: chrono::Duration::minutes(30),
            send_spacing: Duration::from_secs(1),
            trial_reminder_after: chrono::Duration::days(5),
            trial_length: chrono::Duration::days(7),
            trial_link: "http://localhost:8080/trial".to_string(),
            payment_link: "http://localhost:8080/activate".to_string(),
            demo_relay_url: "ws://localhost:8080/demo-ws".to_string(),
            affirmative_keywords: ["YES", "Y", "SI", "SÍ"].iter().map(|s| s.to_string()).collect(),
            trial_keywords: vec!["TRIAL".to_string()],
        }
    }
}

impl NurtureConfig {
    pub fn from_env(base_url: &str) -> Self {
        let defaults = Self::default();
        Self {
            tick_interval: Duration::from_secs(env_parse("TRADIE_NURTURE_TICK_SECS", 1800)),
            batch_size: env_parse("TRADIE_NURTURE_BATCH", defaults.batch_size),
            trial_link: env_or("TRADIE_TRIAL_LINK", &format!("{base_url}/trial")),
            payment_link: env_or("TRADIE_PAYMENT_LINK", &format!("{base_url}/activate")),
            demo_relay_url: format!("{}/demo-ws", relay_base(base_url)),
            ..defaults
        }
    }
}

/// Emergency keyword taxonomy used to flag urgent leads.
///
/// Keywords are matched case-insensitively from a word start, so
/// "frozen pipe" also matches "frozen pipes".
#[derive(Debug, Clone)]
pub struct UrgencyPolicy {
    keywords: Vec<String>,
    pattern: Option<Regex>,
}

impl Default for UrgencyPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_URGENT_KEYWORDS.iter().map(|s| s.to_string()).collect())
    }
}

impl UrgencyPolicy {
    pub fn new(keywords: Vec<String>) -> Self {
        let keywords: Vec<String> = keywords
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        let pattern = if keywords.is_empty() {
            None
        } else {
            let alternation = keywords
                .iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|");
            match Regex::new(&format!(r"(?i)\b(?:{alternation})")) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(error = %e, "Invalid urgency keywords; urgency detection disabled");
                    None
                }
            }
        };

        Self { keywords, pattern }
    }

    pub fn from_env() -> Self {
        env_list("TRADIE_URGENT_KEYWORDS")
            .map(Self::new)
            .unwrap_or_default()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// True if any keyword appears in the text.
    pub fn matches(&self, text: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(text))
    }
}

/// The business served when an inbound address has no tenant of its own.
#[derive(Debug, Clone)]
pub struct TenantDefaults {
    pub business_name: String,
    pub owner_name: String,
    pub owner_phone: String,
    pub transport_address: String,
    pub region: String,
}

impl TenantDefaults {
    pub fn from_env() -> Self {
        Self {
            business_name: env_or("BUSINESS_NAME", "Mike's Emergency Plumbing"),
            owner_name: env_or("BUSINESS_OWNER", "Mike"),
            owner_phone: env_or("OWNER_PHONE", ""),
            transport_address: env_or("TWILIO_PHONE_NUMBER", ""),
            region: env_or("BUSINESS_REGION", "Ontario"),
        }
    }
}

/// Swap an `http(s)` base URL for its WebSocket scheme.
pub fn relay_base(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let items: Vec<String> = std::env::var(key)
        .ok()?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() { None } else { Some(items) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_base_upgrades_scheme() {
        assert_eq!(relay_base("https://desk.example.com"), "wss://desk.example.com");
        assert_eq!(relay_base("http://localhost:8080"), "ws://localhost:8080");
    }

    #[test]
    fn urgency_matches_case_insensitive() {
        let policy = UrgencyPolicy::default();
        assert!(policy.matches("Burst pipe flooding kitchen"));
        assert!(policy.matches("we have NO HEAT at all"));
        assert!(!policy.matches("dripping tap in the bathroom"));
    }

    #[test]
    fn urgency_matches_from_word_start() {
        let policy = UrgencyPolicy::default();
        assert!(policy.matches("I think I have frozen pipes"));
        assert!(!policy.matches("the basement is unflooded"));
    }

    #[test]
    fn urgency_custom_taxonomy() {
        let policy = UrgencyPolicy::new(vec!["Roof Collapse".to_string()]);
        assert!(policy.matches("the roof collapse happened"));
        assert!(!policy.matches("burst pipe"));
    }
}
