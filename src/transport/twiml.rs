//! TwiML documents: relay connections for calls and message replies.

/// Instructions that attach a call to the real-time text relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDocument {
    /// WebSocket endpoint (`wss://…/ws`).
    pub url: String,
    pub language: String,
    pub welcome_greeting: String,
    pub interruptible: bool,
    pub hints: Vec<String>,
}

impl RelayDocument {
    pub fn new(url: impl Into<String>, welcome_greeting: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            language: "en-US".to_string(),
            welcome_greeting: welcome_greeting.into(),
            interruptible: true,
            hints: Vec::new(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.hints = hints;
        self
    }

    /// Render as a `<Connect><ConversationRelay/>` response.
    pub fn render(&self) -> String {
        let mut attrs = format!(
            r#"url="{}" welcomeGreeting="{}" language="{}" interruptible="{}""#,
            escape_xml(&self.url),
            escape_xml(&self.welcome_greeting),
            escape_xml(&self.language),
            self.interruptible,
        );
        if !self.hints.is_empty() {
            attrs.push_str(&format!(r#" hints="{}""#, escape_xml(&self.hints.join(","))));
        }
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><ConversationRelay {attrs}/></Connect></Response>"#
        )
    }
}

/// A synchronous reply to an inbound text. An empty body sends nothing.
pub fn message_reply(body: &str) -> String {
    if body.is_empty() {
        return r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#.to_string();
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Message>{}</Message></Response>"#,
        escape_xml(body)
    )
}

pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_document_carries_settings() {
        let doc = RelayDocument::new("wss://desk.example.com/ws", "Hi, Mike's Plumbing!")
            .with_language("en-AU")
            .with_hints(vec!["furnace".into(), "boiler".into()]);
        let xml = doc.render();

        assert!(xml.contains(r#"url="wss://desk.example.com/ws""#));
        assert!(xml.contains(r#"welcomeGreeting="Hi, Mike&apos;s Plumbing!""#));
        assert!(xml.contains(r#"language="en-AU""#));
        assert!(xml.contains(r#"interruptible="true""#));
        assert!(xml.contains(r#"hints="furnace,boiler""#));
    }

    #[test]
    fn hints_omitted_when_empty() {
        let xml = RelayDocument::new("wss://x/ws", "Hello").render();
        assert!(!xml.contains("hints="));
    }

    #[test]
    fn message_reply_escapes_body() {
        let xml = message_reply("Tom & Jerry <3");
        assert!(xml.contains("<Message>Tom &amp; Jerry &lt;3</Message>"));
        assert!(!message_reply("").contains("<Message>"));
    }
}
